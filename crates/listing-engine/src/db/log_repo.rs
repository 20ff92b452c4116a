//! Append-only audit log. Rows are never updated or deleted.

use rusqlite::{params, Row};

use super::{decode_time, encode_time, Database, DatabaseError};
use crate::model::PipelineLog;

fn from_row(row: &Row<'_>) -> Result<PipelineLog, rusqlite::Error> {
    Ok(PipelineLog {
        product_id: row.get("product_id")?,
        phase: row.get("phase_number")?,
        job_id: row.get("job_id")?,
        level: row.get("level")?,
        message: row.get("message")?,
        action: row.get("action")?,
        created_at: decode_time(row, "created_at")?,
    })
}

pub fn insert(db: &Database, entry: &PipelineLog) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO pipeline_logs (product_id, phase_number, job_id, level, message, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.product_id,
                entry.phase,
                entry.job_id,
                entry.level,
                entry.message,
                entry.action,
                encode_time(&entry.created_at),
            ],
        )?;
        Ok(())
    })
}

/// Entries for a product in write order.
pub fn list_for_product(db: &Database, product_id: &str) -> Result<Vec<PipelineLog>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM pipeline_logs WHERE product_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![product_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogAction, LogLevel, Phase};

    #[test]
    fn test_insert_and_list() {
        let db = Database::open_in_memory().unwrap();
        insert(
            &db,
            &PipelineLog::new("p", Some(Phase::Recognition), LogLevel::Info, LogAction::StartPhase, "go")
                .with_job("job-1"),
        )
        .unwrap();
        insert(
            &db,
            &PipelineLog::new("p", None, LogLevel::Warn, LogAction::Pause, "paused"),
        )
        .unwrap();
        insert(
            &db,
            &PipelineLog::new("other", None, LogLevel::Info, LogAction::Enqueue, "x"),
        )
        .unwrap();

        let logs = list_for_product(&db, "p").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, LogAction::StartPhase);
        assert_eq!(logs[0].job_id.as_deref(), Some("job-1"));
        assert_eq!(logs[0].phase, Some(Phase::Recognition));
        assert_eq!(logs[1].phase, None);
        assert_eq!(logs[1].level, LogLevel::Warn);
    }
}
