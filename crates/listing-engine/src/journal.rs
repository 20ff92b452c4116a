//! Writes audit rows and mirrors them to the operational log.

use std::sync::Arc;

use crate::model::{LogLevel, PipelineLog};
use crate::store::PipelineStore;

/// Audit writes never fail the caller. A lost audit row is logged and the
/// state transition it describes stands.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn PipelineStore>,
}

impl Journal {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: PipelineLog) {
        let phase = entry
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        match entry.level {
            LogLevel::Info => log::info!(
                "[{}] {} {}: {}",
                entry.product_id, phase, entry.action, entry.message
            ),
            LogLevel::Warn => log::warn!(
                "[{}] {} {}: {}",
                entry.product_id, phase, entry.action, entry.message
            ),
            LogLevel::Error => log::error!(
                "[{}] {} {}: {}",
                entry.product_id, phase, entry.action, entry.message
            ),
        }

        if let Err(e) = self.store.insert_log(&entry).await {
            log::error!(
                "Failed to write {} audit entry for product '{}': {}",
                entry.action,
                entry.product_id,
                e
            );
        }
    }
}
