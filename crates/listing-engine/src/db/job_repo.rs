//! Job repository: the `background_jobs` table.
//!
//! Ownership changes are single conditional statements. `claim` is the
//! cross-process lease: `pending -> running` guarded by `status = 'pending'`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{decode_opt_time, decode_time, encode_opt_time, encode_time, Database, DatabaseError};
use crate::model::{BackgroundJob, JobLease, Phase};

const PRIORITY_ORDER: &str =
    "CASE j.priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END";

fn from_row(row: &Row<'_>) -> Result<BackgroundJob, rusqlite::Error> {
    Ok(BackgroundJob {
        id: row.get("id")?,
        product_id: row.get("product_id")?,
        phase: row.get("phase_number")?,
        priority: row.get("priority")?,
        status: row.get("status")?,
        scheduled_at: decode_time(row, "scheduled_at")?,
        started_at: decode_opt_time(row, "started_at")?,
        completed_at: decode_opt_time(row, "completed_at")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        worker_id: row.get("worker_id")?,
        error_message: row.get("error_message")?,
        created_at: decode_time(row, "created_at")?,
    })
}

/// Inserts a job unless an active (pending/running) job already exists for
/// the same (product, phase). Returns whether the row was inserted.
pub fn insert(db: &Database, job: &BackgroundJob) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO background_jobs (id, product_id, phase_number, priority,
             status, scheduled_at, started_at, completed_at, retry_count, max_retries,
             worker_id, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                job.id,
                job.product_id,
                job.phase,
                job.priority,
                job.status,
                encode_time(&job.scheduled_at),
                encode_opt_time(&job.started_at),
                encode_opt_time(&job.completed_at),
                job.retry_count,
                job.max_retries,
                job.worker_id,
                job.error_message,
                encode_time(&job.created_at),
            ],
        )?;
        Ok(inserted > 0)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row(
                "SELECT * FROM background_jobs WHERE id = ?1",
                params![id],
                from_row,
            )
            .optional()?;
        Ok(job)
    })
}

/// The pending or running job for (product, phase), if any.
pub fn find_active(
    db: &Database,
    product_id: &str,
    phase: Phase,
) -> Result<Option<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row(
                "SELECT * FROM background_jobs
                 WHERE product_id = ?1 AND phase_number = ?2
                   AND status IN ('pending', 'running')",
                params![product_id, phase],
                from_row,
            )
            .optional()?;
        Ok(job)
    })
}

/// Most recently created job for (product, phase), whatever its status.
pub fn find_latest(
    db: &Database,
    product_id: &str,
    phase: Phase,
) -> Result<Option<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row(
                "SELECT * FROM background_jobs
                 WHERE product_id = ?1 AND phase_number = ?2
                 ORDER BY seq DESC LIMIT 1",
                params![product_id, phase],
                from_row,
            )
            .optional()?;
        Ok(job)
    })
}

pub fn list_for_product(db: &Database, product_id: &str) -> Result<Vec<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM background_jobs WHERE product_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![product_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Next claim candidate: due pending jobs by priority, then creation order.
///
/// Jobs of paused products are skipped. Jobs whose product row is missing
/// are still returned so the worker can drop them as invalid.
pub fn find_claimable(db: &Database, now: DateTime<Utc>) -> Result<Option<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT j.* FROM background_jobs j
             LEFT JOIN products p ON p.id = j.product_id
             WHERE j.status = 'pending' AND j.scheduled_at <= ?1
               AND (p.status IS NULL OR p.status != 'paused')
             ORDER BY {}, j.created_at ASC, j.seq ASC
             LIMIT 1",
            PRIORITY_ORDER
        );
        let job = conn
            .query_row(&sql, params![encode_time(&now)], from_row)
            .optional()?;
        Ok(job)
    })
}

/// Atomically takes ownership of a pending job. Returns `None` when another
/// worker got there first.
pub fn claim(
    db: &Database,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row(
                "UPDATE background_jobs
                 SET status = 'running', worker_id = ?2, started_at = ?3,
                     completed_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'
                 RETURNING *",
                params![id, worker_id, encode_time(&now)],
                from_row,
            )
            .optional()?;
        Ok(job)
    })
}

/// `running -> completed`, only for the worker that still holds the lease.
pub fn complete(
    db: &Database,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE background_jobs
             SET status = 'completed', completed_at = ?3, error_message = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'running' AND worker_id = ?2",
            params![id, worker_id, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// `lease -> pending` at `scheduled_at`, releasing the lease.
///
/// A held lease must still name its worker; an expired one only needs the
/// row to still be `failed`. `OR IGNORE` turns a clash with a newer active
/// job for the same phase into a non-match instead of an error.
pub fn reschedule(
    db: &Database,
    id: &str,
    lease: JobLease<'_>,
    retry_count: u32,
    scheduled_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE OR IGNORE background_jobs
             SET status = 'pending', retry_count = ?3, scheduled_at = ?4, worker_id = NULL,
                 started_at = NULL, completed_at = NULL, error_message = ?5, updated_at = ?6
             WHERE id = ?1 AND status = ?2 AND (?7 IS NULL OR worker_id = ?7)",
            params![
                id,
                lease.expected_status(),
                retry_count,
                encode_time(&scheduled_at),
                error,
                encode_time(&now),
                lease.owner()
            ],
        )?;
        Ok(changed > 0)
    })
}

/// `lease -> failed`. Terminal: nothing reschedules a failed job.
pub fn fail(
    db: &Database,
    id: &str,
    lease: JobLease<'_>,
    retry_count: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE background_jobs
             SET status = 'failed', retry_count = ?3, error_message = ?4,
                 completed_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = ?2 AND (?6 IS NULL OR worker_id = ?6)",
            params![
                id,
                lease.expected_status(),
                retry_count,
                error,
                encode_time(&now),
                lease.owner()
            ],
        )?;
        Ok(changed > 0)
    })
}

/// `running -> failed` for a job whose lease started at or before `cutoff`.
pub fn expire(
    db: &Database,
    id: &str,
    cutoff: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE background_jobs
             SET status = 'failed', error_message = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running' AND started_at <= ?2",
            params![id, encode_time(&cutoff), error, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// Running jobs whose lease started at or before `cutoff`, oldest first.
pub fn find_stale(db: &Database, cutoff: DateTime<Utc>) -> Result<Vec<BackgroundJob>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM background_jobs
             WHERE status = 'running' AND started_at <= ?1
             ORDER BY started_at ASC",
        )?;
        let rows = stmt
            .query_map(params![encode_time(&cutoff)], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
