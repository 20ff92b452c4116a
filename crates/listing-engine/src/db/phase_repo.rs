//! Phase repository: guarded status transitions on `pipeline_phases`.
//!
//! Every transition is a single conditional UPDATE; the returned `bool`
//! reports whether the guard matched.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{decode_opt_time, decode_time, encode_opt_time, encode_time, Database, DatabaseError};
use crate::model::{Phase, PipelinePhase};

fn from_row(row: &Row<'_>) -> Result<PipelinePhase, rusqlite::Error> {
    Ok(PipelinePhase {
        product_id: row.get("product_id")?,
        phase: row.get("phase_number")?,
        status: row.get("status")?,
        can_start: row.get("can_start")?,
        progress_percentage: row.get("progress_percentage")?,
        started_at: decode_opt_time(row, "started_at")?,
        completed_at: decode_opt_time(row, "completed_at")?,
        retry_count: row.get("retry_count")?,
        error_message: row.get("error_message")?,
        updated_at: decode_time(row, "updated_at")?,
    })
}

pub(crate) fn upsert_in(conn: &Connection, phase: &PipelinePhase) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO pipeline_phases (product_id, phase_number, status, can_start,
         progress_percentage, started_at, completed_at, retry_count, error_message, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(product_id, phase_number) DO UPDATE SET
            status = excluded.status,
            can_start = excluded.can_start,
            progress_percentage = excluded.progress_percentage,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            retry_count = excluded.retry_count,
            error_message = excluded.error_message,
            updated_at = excluded.updated_at",
        params![
            phase.product_id,
            phase.phase,
            phase.status,
            phase.can_start,
            phase.progress_percentage.min(100),
            encode_opt_time(&phase.started_at),
            encode_opt_time(&phase.completed_at),
            phase.retry_count,
            phase.error_message,
            encode_time(&phase.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts or overwrites a phase row.
pub fn upsert(db: &Database, phase: &PipelinePhase) -> Result<(), DatabaseError> {
    db.with_conn(|conn| upsert_in(conn, phase))
}

pub fn find(
    db: &Database,
    product_id: &str,
    phase: Phase,
) -> Result<Option<PipelinePhase>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM pipeline_phases WHERE product_id = ?1 AND phase_number = ?2",
                params![product_id, phase],
                from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_for_product(db: &Database, product_id: &str) -> Result<Vec<PipelinePhase>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM pipeline_phases WHERE product_id = ?1 ORDER BY phase_number ASC",
        )?;
        let rows = stmt
            .query_map(params![product_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// `pending|failed|running -> running`.
///
/// Matches only when the previous phase is completed and no other phase of
/// the product is running. Restarting a phase left `running` by a dead
/// worker is allowed because the caller holds the phase's only job lease.
pub fn start(
    db: &Database,
    product_id: &str,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE pipeline_phases
             SET status = 'running', started_at = ?3, completed_at = NULL,
                 progress_percentage = 0, can_start = 1, updated_at = ?3
             WHERE product_id = ?1 AND phase_number = ?2 AND status != 'completed'
               AND (?2 = 1 OR EXISTS (
                    SELECT 1 FROM pipeline_phases prev
                    WHERE prev.product_id = ?1 AND prev.phase_number = ?2 - 1
                      AND prev.status = 'completed'))
               AND NOT EXISTS (
                    SELECT 1 FROM pipeline_phases other
                    WHERE other.product_id = ?1 AND other.phase_number != ?2
                      AND other.status = 'running')",
            params![product_id, phase, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// `* -> completed`, and opens the next phase's `can_start` hint.
pub fn complete(
    db: &Database,
    product_id: &str,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let now = encode_time(&now);
        let changed = tx.execute(
            "UPDATE pipeline_phases
             SET status = 'completed', progress_percentage = 100, completed_at = ?3,
                 error_message = NULL, updated_at = ?3
             WHERE product_id = ?1 AND phase_number = ?2 AND status != 'completed'",
            params![product_id, phase, now],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(next) = phase.next() {
            tx.execute(
                "UPDATE pipeline_phases SET can_start = 1, updated_at = ?3
                 WHERE product_id = ?1 AND phase_number = ?2",
                params![product_id, next, now],
            )?;
        }
        Ok(true)
    })
}

/// Records a failed attempt. A terminal failure leaves the phase `failed`;
/// otherwise it returns to `pending` awaiting the rescheduled job.
pub fn record_failure(
    db: &Database,
    product_id: &str,
    phase: Phase,
    error: &str,
    retry_count: u32,
    terminal: bool,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let status = if terminal { "failed" } else { "pending" };
        let changed = conn.execute(
            "UPDATE pipeline_phases
             SET status = ?3, error_message = ?4, retry_count = ?5, updated_at = ?6
             WHERE product_id = ?1 AND phase_number = ?2 AND status != 'completed'",
            params![product_id, phase, status, error, retry_count, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// `failed -> pending` with a fresh retry budget (manual re-trigger).
pub fn reset_failed(
    db: &Database,
    product_id: &str,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE pipeline_phases
             SET status = 'pending', retry_count = 0, error_message = NULL,
                 progress_percentage = 0, started_at = NULL, updated_at = ?3
             WHERE product_id = ?1 AND phase_number = ?2 AND status = 'failed'",
            params![product_id, phase, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// Progress updates only land on a running phase.
pub fn update_progress(
    db: &Database,
    product_id: &str,
    phase: Phase,
    percentage: u8,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE pipeline_phases SET progress_percentage = ?3, updated_at = ?4
             WHERE product_id = ?1 AND phase_number = ?2 AND status = 'running'",
            params![product_id, phase, percentage.min(100), encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::product_repo;
    use crate::model::{PhaseStatus, Product};

    fn seeded() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        product_repo::insert_with_phases(&db, &Product::new("p-1", Utc::now())).unwrap();
        db
    }

    fn status_of(db: &Database, phase: Phase) -> PhaseStatus {
        find(db, "p-1", phase).unwrap().unwrap().status
    }

    #[test]
    fn test_first_phase_can_start() {
        let db = seeded();
        assert!(start(&db, "p-1", Phase::Recognition, Utc::now()).unwrap());
        assert_eq!(status_of(&db, Phase::Recognition), PhaseStatus::Running);
    }

    #[test]
    fn test_start_requires_previous_completed() {
        let db = seeded();
        assert!(!start(&db, "p-1", Phase::MarketResearch, Utc::now()).unwrap());
        assert_eq!(status_of(&db, Phase::MarketResearch), PhaseStatus::Pending);

        complete(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();
        assert!(start(&db, "p-1", Phase::MarketResearch, Utc::now()).unwrap());
    }

    #[test]
    fn test_start_refuses_when_other_phase_running() {
        let db = seeded();
        complete(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();
        complete(&db, "p-1", Phase::MarketResearch, Utc::now()).unwrap();
        // Force an inconsistent running phase 1 next to the startable phase 3.
        let mut first = find(&db, "p-1", Phase::Recognition).unwrap().unwrap();
        first.status = PhaseStatus::Running;
        upsert(&db, &first).unwrap();

        assert!(!start(&db, "p-1", Phase::Pricing, Utc::now()).unwrap());
    }

    #[test]
    fn test_complete_opens_next_phase() {
        let db = seeded();
        start(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();
        assert!(complete(&db, "p-1", Phase::Recognition, Utc::now()).unwrap());

        let first = find(&db, "p-1", Phase::Recognition).unwrap().unwrap();
        assert_eq!(first.status, PhaseStatus::Completed);
        assert_eq!(first.progress_percentage, 100);
        assert!(first.completed_at.is_some());
        assert!(find(&db, "p-1", Phase::MarketResearch).unwrap().unwrap().can_start);

        // Second completion is a no-op.
        assert!(!complete(&db, "p-1", Phase::Recognition, Utc::now()).unwrap());
    }

    #[test]
    fn test_record_failure_terminal_and_retryable() {
        let db = seeded();
        start(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();

        assert!(record_failure(&db, "p-1", Phase::Recognition, "timeout", 1, false, Utc::now()).unwrap());
        let row = find(&db, "p-1", Phase::Recognition).unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Pending);
        assert_eq!(row.retry_count, 1);

        assert!(record_failure(&db, "p-1", Phase::Recognition, "dead", 3, true, Utc::now()).unwrap());
        let row = find(&db, "p-1", Phase::Recognition).unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("dead"));

        assert!(reset_failed(&db, "p-1", Phase::Recognition, Utc::now()).unwrap());
        let row = find(&db, "p-1", Phase::Recognition).unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Pending);
        assert_eq!(row.retry_count, 0);
    }

    #[test]
    fn test_failure_never_overwrites_completed() {
        let db = seeded();
        complete(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();
        assert!(!record_failure(&db, "p-1", Phase::Recognition, "late", 1, true, Utc::now()).unwrap());
        assert_eq!(status_of(&db, Phase::Recognition), PhaseStatus::Completed);
    }

    #[test]
    fn test_progress_only_while_running() {
        let db = seeded();
        assert!(!update_progress(&db, "p-1", Phase::Recognition, 40, Utc::now()).unwrap());
        start(&db, "p-1", Phase::Recognition, Utc::now()).unwrap();
        assert!(update_progress(&db, "p-1", Phase::Recognition, 140, Utc::now()).unwrap());
        assert_eq!(
            find(&db, "p-1", Phase::Recognition).unwrap().unwrap().progress_percentage,
            100
        );
    }
}
