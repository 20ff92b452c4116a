//! Stuck-phase repair: aligns phase status with already-stored output.
//!
//! Walks phases in order and completes any phase whose output exists but
//! whose status says otherwise. Stops at the first phase without output.
//! Never runs an executor and never sets a phase to `running`.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::context::EngineContext;
use crate::events::PipelineEvent;
use crate::model::{
    LogAction, LogLevel, Phase, PhaseStatus, PipelineLog, ProductStatus, ProductStatusChange,
};
use crate::phase::Advance;
use crate::store::StoreResult;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub product_id: String,
    /// Phases forced to `completed`, in order.
    pub repaired: Vec<Phase>,
    /// Follow-up after the last repaired phase, if anything was repaired.
    pub advance: Option<Advance>,
}

impl ReconcileReport {
    fn empty(product_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            repaired: Vec::new(),
            advance: None,
        }
    }

    /// Nothing was written.
    pub fn is_noop(&self) -> bool {
        self.repaired.is_empty()
    }
}

#[derive(Clone)]
pub struct PhaseReconciler {
    ctx: EngineContext,
}

impl PhaseReconciler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn reconcile_product(&self, product_id: &str) -> StoreResult<ReconcileReport> {
        let store = &self.ctx.store;
        let mut report = ReconcileReport::empty(product_id);

        let Some(product) = store.get_product(product_id).await? else {
            log::debug!("Reconcile skipped: product '{}' not found", product_id);
            return Ok(report);
        };
        let phases = store.list_phases(product_id).await?;

        for phase in Phase::ALL {
            let status = phases
                .iter()
                .find(|p| p.phase == phase)
                .map(|p| p.status)
                .unwrap_or(PhaseStatus::Pending);
            if status == PhaseStatus::Completed {
                continue;
            }
            if store.get_phase_output(product_id, phase).await?.is_none() {
                break;
            }

            if self.ctx.machine.mark_completed(product_id, phase).await? {
                report.repaired.push(phase);
                self.ctx
                    .journal
                    .record(PipelineLog::new(
                        product_id,
                        Some(phase),
                        LogLevel::Info,
                        LogAction::ReconcilePhase,
                        format!("Marked {} completed from stored output (was {})", phase, status),
                    ))
                    .await;
                self.ctx.events.send(PipelineEvent::PhaseRepaired {
                    product_id: product_id.to_string(),
                    phase,
                    timestamp: Utc::now(),
                });
            }
        }

        let Some(&last) = report.repaired.last() else {
            return Ok(report);
        };

        if last != Phase::LAST && product.status == ProductStatus::Error {
            // The repaired phase was what put the product into error.
            store
                .update_product_status(
                    product_id,
                    &ProductStatusChange::to(ProductStatus::Processing)
                        .only_from(&[ProductStatus::Error])
                        .running(true)
                        .manual_review(false)
                        .clear_error(),
                )
                .await?;
        }

        let priority = store
            .latest_job(product_id, last)
            .await?
            .map(|job| job.priority)
            .unwrap_or_default();
        report.advance = Some(self.ctx.machine.advance(product_id, last, priority).await?);

        log::info!(
            "Reconciled product '{}': repaired {:?}",
            product_id,
            report.repaired
        );
        Ok(report)
    }

    /// Reconciles every product the pipeline has not settled yet.
    pub async fn reconcile_all(&self) -> StoreResult<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for product in self.ctx.store.list_products_in_flight().await? {
            let report = self.reconcile_product(&product.id).await?;
            if !report.is_noop() {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Spawns a periodic `reconcile_all` loop. The immediate first tick is
    /// skipped.
    pub fn start(&self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                match reconciler.reconcile_all().await {
                    Ok(reports) if !reports.is_empty() => {
                        log::info!("Periodic reconcile repaired {} product(s)", reports.len());
                    }
                    Err(e) => log::error!("Periodic reconcile failed: {}", e),
                    _ => {}
                }
            }
            log::debug!("Reconciler stopped");
        })
    }
}
