//! Product repository: the `products` table plus creation of its phase rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{decode_time, encode_time, phase_repo, Database, DatabaseError};
use crate::model::{Phase, PipelinePhase, Product, ProductStatusChange};

fn from_row(row: &Row<'_>) -> Result<Product, rusqlite::Error> {
    Ok(Product {
        id: row.get("id")?,
        current_phase: row.get("current_phase")?,
        status: row.get("status")?,
        is_pipeline_running: row.get("is_pipeline_running")?,
        requires_manual_review: row.get("requires_manual_review")?,
        error_message: row.get("error_message")?,
        created_at: decode_time(row, "created_at")?,
        updated_at: decode_time(row, "updated_at")?,
    })
}

/// Inserts a product together with its four phase rows in one transaction.
///
/// Returns `false` without touching anything if the product already exists.
pub fn insert_with_phases(db: &Database, product: &Product) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO products (id, current_phase, status, is_pipeline_running,
             requires_manual_review, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                product.id,
                product.current_phase,
                product.status,
                product.is_pipeline_running,
                product.requires_manual_review,
                product.error_message,
                encode_time(&product.created_at),
                encode_time(&product.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        for phase in Phase::ALL {
            let row = PipelinePhase::initial(product.id.as_str(), phase, product.created_at);
            phase_repo::upsert_in(tx, &row)?;
        }
        Ok(true)
    })
}

/// Finds a product by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Product>, DatabaseError> {
    db.with_conn(|conn| {
        let product = conn
            .query_row("SELECT * FROM products WHERE id = ?1", params![id], from_row)
            .optional()?;
        Ok(product)
    })
}

/// Products the pipeline has not settled yet (anything but completed/published).
pub fn list_in_flight(db: &Database) -> Result<Vec<Product>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM products WHERE status NOT IN ('completed', 'published')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Applies a status change. Returns whether a row was updated.
pub fn update_status(
    db: &Database,
    id: &str,
    change: &ProductStatusChange,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let mut assignments = vec!["status = ?1".to_string(), "updated_at = ?2".to_string()];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(change.status),
            Box::new(encode_time(&now)),
        ];

        if let Some(running) = change.is_pipeline_running {
            param_values.push(Box::new(running));
            assignments.push(format!("is_pipeline_running = ?{}", param_values.len()));
        }
        if let Some(review) = change.requires_manual_review {
            param_values.push(Box::new(review));
            assignments.push(format!("requires_manual_review = ?{}", param_values.len()));
        }
        if let Some(ref message) = change.error_message {
            param_values.push(Box::new(message.clone()));
            assignments.push(format!("error_message = ?{}", param_values.len()));
        }

        param_values.push(Box::new(id.to_string()));
        let mut sql = format!(
            "UPDATE products SET {} WHERE id = ?{}",
            assignments.join(", "),
            param_values.len()
        );

        if let Some(ref expected) = change.expected {
            if expected.is_empty() {
                return Ok(false);
            }
            let mut placeholders = Vec::with_capacity(expected.len());
            for status in expected {
                param_values.push(Box::new(*status));
                placeholders.push(format!("?{}", param_values.len()));
            }
            sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_ref.as_slice())?;
        Ok(changed > 0)
    })
}

/// Moves `current_phase` forward. Never moves it backwards.
pub fn advance_current_phase(
    db: &Database,
    id: &str,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE products SET current_phase = ?2, updated_at = ?3
             WHERE id = ?1 AND current_phase < ?2",
            params![id, phase, encode_time(&now)],
        )?;
        Ok(changed > 0)
    })
}
