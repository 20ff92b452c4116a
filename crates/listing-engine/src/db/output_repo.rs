//! Executor outputs, one JSON payload per (product, phase).

use rusqlite::{params, OptionalExtension};

use super::{decode_time, encode_time, Database, DatabaseError};
use crate::model::{Phase, PhaseOutput};

/// Stores the payload verbatim, replacing any earlier output for the phase.
pub fn upsert(db: &Database, output: &PhaseOutput) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(&output.payload)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO phase_outputs (product_id, phase_number, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(product_id, phase_number) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at",
            params![
                output.product_id,
                output.phase,
                payload,
                encode_time(&output.created_at)
            ],
        )?;
        Ok(())
    })
}

pub fn find(db: &Database, product_id: &str, phase: Phase) -> Result<Option<PhaseOutput>, DatabaseError> {
    let row = db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT product_id, phase_number, payload, created_at FROM phase_outputs
                 WHERE product_id = ?1 AND phase_number = ?2",
                params![product_id, phase],
                |row| {
                    Ok((
                        row.get::<_, String>("product_id")?,
                        row.get::<_, Phase>("phase_number")?,
                        row.get::<_, String>("payload")?,
                        decode_time(row, "created_at")?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    })?;

    match row {
        Some((product_id, phase, payload, created_at)) => Ok(Some(PhaseOutput {
            product_id,
            phase,
            payload: serde_json::from_str(&payload)?,
            created_at,
        })),
        None => Ok(None),
    }
}
