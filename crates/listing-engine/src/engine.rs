//! Engine facade: wires the store, the executors and the configuration
//! into a worker pool plus the recovery timers, and exposes the product
//! lifecycle operations.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_config, EngineConfig};
use crate::context::EngineContext;
use crate::error::{ConfigError, EngineError, Result, ValidationError};
use crate::events::{EventBroadcaster, PipelineEvent};
use crate::executor::ExecutorRegistry;
use crate::model::{
    JobPriority, LogAction, LogLevel, Phase, PhaseStatus, PipelineLog, Product, ProductStatus,
    ProductStatusChange,
};
use crate::queue::{EnqueueOutcome, RetryPolicy};
use crate::recovery::{PhaseReconciler, ReapReport, ReconcileReport, StaleJobReaper};
use crate::store::{PipelineStore, SqliteStore};
use crate::worker::WorkerPool;

/// Result of `fix_stuck_phases`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckPhaseFix {
    pub repaired: Vec<Phase>,
    /// Phase that was re-enqueued because nothing was active for it.
    pub resumed: Option<Phase>,
}

pub struct PipelineEngine {
    ctx: EngineContext,
    pool: WorkerPool,
    reaper: StaleJobReaper,
    reconciler: PhaseReconciler,
    config: EngineConfig,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        executors: ExecutorRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        validate_config(&config)?;

        let missing = executors.missing();
        if !missing.is_empty() {
            log::warn!(
                "No executor registered for {:?}; jobs for these phases will be dropped",
                missing
            );
        }

        let ctx = EngineContext::new(
            store,
            EventBroadcaster::default(),
            RetryPolicy::from(&config.retry),
        );
        let pool = WorkerPool::new(ctx.clone(), executors, config.worker.clone());
        let reaper = StaleJobReaper::new(ctx.clone(), config.reaper.stale_after());
        let reconciler = PhaseReconciler::new(ctx.clone());

        Ok(Self {
            ctx,
            pool,
            reaper,
            reconciler,
            config,
        })
    }

    /// Opens the SQLite store at the configured path and builds an engine on it.
    pub fn open(config: EngineConfig, executors: ExecutorRegistry) -> Result<Self> {
        validate_config(&config)?;
        let path = config
            .database
            .resolved_path()
            .ok_or_else(|| ConfigError::Validation {
                message: "database.path is not set and no home directory was found".into(),
            })?;
        let store = SqliteStore::open(&path)?;
        Self::new(Arc::new(store), executors, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.ctx.store
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.ctx.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Registers a product (if new) and schedules phase 1.
    pub async fn submit_product(&self, product_id: &str, priority: JobPriority) -> Result<EnqueueOutcome> {
        let store = &self.ctx.store;
        match store.get_product(product_id).await? {
            Some(product) if product.status != ProductStatus::Uploading => {
                return Err(invalid_state(&product, "uploading"));
            }
            Some(_) => {}
            None => {
                store.create_product(&Product::new(product_id, Utc::now())).await?;
            }
        }

        let outcome = self
            .ctx
            .scheduler
            .enqueue(product_id, Phase::FIRST, priority)
            .await?;
        store
            .update_product_status(
                product_id,
                &ProductStatusChange::to(ProductStatus::Processing)
                    .only_from(&[ProductStatus::Uploading])
                    .running(true),
            )
            .await?;

        log::info!("Submitted product '{}' with {} priority", product_id, priority);
        Ok(outcome)
    }

    /// Stops claiming jobs for the product. A phase already running finishes.
    pub async fn pause_product(&self, product_id: &str) -> Result<()> {
        self.transition(
            product_id,
            ProductStatusChange::to(ProductStatus::Paused)
                .only_from(&[ProductStatus::Uploading, ProductStatus::Processing])
                .running(false),
            "uploading or processing",
        )
        .await?;
        self.audit(product_id, LogAction::Pause, "Pipeline paused").await;
        Ok(())
    }

    pub async fn resume_product(&self, product_id: &str) -> Result<()> {
        self.transition(
            product_id,
            ProductStatusChange::to(ProductStatus::Processing)
                .only_from(&[ProductStatus::Paused])
                .running(true),
            "paused",
        )
        .await?;
        self.audit(product_id, LogAction::Resume, "Pipeline resumed").await;
        Ok(())
    }

    pub async fn mark_published(&self, product_id: &str) -> Result<()> {
        self.transition(
            product_id,
            ProductStatusChange::to(ProductStatus::Published).only_from(&[ProductStatus::Completed]),
            "completed",
        )
        .await?;
        log::info!("Product '{}' published", product_id);
        Ok(())
    }

    /// Manual re-trigger after a permanent failure. The failed phase gets a
    /// fresh retry budget. Returns the phase that was re-enqueued.
    pub async fn retry_failed_phase(&self, product_id: &str) -> Result<Phase> {
        let store = &self.ctx.store;
        if store.get_product(product_id).await?.is_none() {
            return Err(ValidationError::ProductNotFound(product_id.to_string()).into());
        }

        let failed = store
            .list_phases(product_id)
            .await?
            .into_iter()
            .find(|p| p.status == PhaseStatus::Failed)
            .map(|p| p.phase)
            .ok_or_else(|| ValidationError::NothingToRetry(product_id.to_string()))?;

        if !store.reset_failed_phase(product_id, failed).await? {
            return Err(ValidationError::NothingToRetry(product_id.to_string()).into());
        }

        store
            .update_product_status(
                product_id,
                &ProductStatusChange::to(ProductStatus::Processing)
                    .only_from(&[
                        ProductStatus::Error,
                        ProductStatus::Uploading,
                        ProductStatus::Processing,
                    ])
                    .running(true)
                    .manual_review(false)
                    .clear_error(),
            )
            .await?;

        let priority = self.last_priority(product_id, failed).await?;
        self.ctx.scheduler.enqueue(product_id, failed, priority).await?;
        self.audit_phase(
            product_id,
            failed,
            LogAction::ManualRetry,
            format!("Manual retry of {}", failed),
        )
        .await;
        Ok(failed)
    }

    /// Repairs phases from stored output, then re-enqueues the first
    /// unfinished phase if no job is active for it. Failed phases are left
    /// to `retry_failed_phase`.
    pub async fn fix_stuck_phases(&self, product_id: &str) -> Result<StuckPhaseFix> {
        let store = &self.ctx.store;
        let report = self.reconciler.reconcile_product(product_id).await?;
        let Some(product) = store.get_product(product_id).await? else {
            return Err(ValidationError::ProductNotFound(product_id.to_string()).into());
        };

        let mut fix = StuckPhaseFix {
            repaired: report.repaired,
            resumed: None,
        };
        if matches!(product.status, ProductStatus::Completed | ProductStatus::Published) {
            return Ok(fix);
        }

        let stuck = store
            .list_phases(product_id)
            .await?
            .into_iter()
            .find(|p| p.status != PhaseStatus::Completed);
        let Some(stuck) = stuck else {
            return Ok(fix);
        };
        if stuck.status == PhaseStatus::Failed
            || store.active_job(product_id, stuck.phase).await?.is_some()
        {
            return Ok(fix);
        }

        let priority = self.last_priority(product_id, stuck.phase).await?;
        if self
            .ctx
            .scheduler
            .enqueue(product_id, stuck.phase, priority)
            .await?
            .is_enqueued()
        {
            store
                .update_product_status(
                    product_id,
                    &ProductStatusChange::to(ProductStatus::Processing)
                        .only_from(&[ProductStatus::Uploading])
                        .running(true),
                )
                .await?;
            self.audit_phase(
                product_id,
                stuck.phase,
                LogAction::ReconcilePhase,
                format!("Re-enqueued {} ({} with no active job)", stuck.phase, stuck.status),
            )
            .await;
            fix.resumed = Some(stuck.phase);
        }
        Ok(fix)
    }

    pub async fn reconcile(&self, product_id: &str) -> Result<ReconcileReport> {
        Ok(self.reconciler.reconcile_product(product_id).await?)
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        Ok(self.reconciler.reconcile_all().await?)
    }

    pub async fn reap_stale_jobs(&self) -> Result<ReapReport> {
        Ok(self.reaper.reap_once().await?)
    }

    /// Drains all currently due work in this process.
    pub async fn run_until_idle(&self) -> usize {
        self.pool.run_until_idle().await
    }

    /// Spawns the worker loop, the reaper and (if configured) the periodic
    /// reconciler.
    pub fn start(&self) -> EngineHandle {
        let cancel = CancellationToken::new();
        let worker = self.pool.start(cancel.child_token());
        let reaper = self
            .reaper
            .start(self.config.reaper.interval(), cancel.child_token());
        let reconciler = self
            .config
            .reconciler
            .interval()
            .map(|interval| self.reconciler.start(interval, cancel.child_token()));

        log::info!("Pipeline engine started (worker {})", self.pool.worker_id());
        EngineHandle {
            cancel,
            worker,
            reaper,
            reconciler,
        }
    }

    async fn transition(
        &self,
        product_id: &str,
        change: ProductStatusChange,
        expected: &str,
    ) -> Result<()> {
        if self.ctx.store.update_product_status(product_id, &change).await? {
            return Ok(());
        }
        match self.ctx.store.get_product(product_id).await? {
            Some(product) => Err(invalid_state(&product, expected)),
            None => Err(ValidationError::ProductNotFound(product_id.to_string()).into()),
        }
    }

    async fn last_priority(&self, product_id: &str, phase: Phase) -> Result<JobPriority> {
        Ok(self
            .ctx
            .store
            .latest_job(product_id, phase)
            .await?
            .map(|job| job.priority)
            .unwrap_or_default())
    }

    async fn audit(&self, product_id: &str, action: LogAction, message: &str) {
        self.ctx
            .journal
            .record(PipelineLog::new(product_id, None, LogLevel::Info, action, message))
            .await;
    }

    async fn audit_phase(&self, product_id: &str, phase: Phase, action: LogAction, message: String) {
        self.ctx
            .journal
            .record(PipelineLog::new(product_id, Some(phase), LogLevel::Info, action, message))
            .await;
    }
}

fn invalid_state(product: &Product, expected: &str) -> EngineError {
    ValidationError::InvalidProductState {
        product_id: product.id.clone(),
        status: product.status.to_string(),
        expected: expected.to_string(),
    }
    .into()
}

/// Owns the background tasks of a started engine.
pub struct EngineHandle {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    reaper: JoinHandle<()>,
    reconciler: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every loop and waits for them. The worker honours its
    /// shutdown timeout before returning.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.worker.await?;
        self.reaper.await?;
        if let Some(reconciler) = self.reconciler {
            reconciler.await?;
        }
        log::info!("Pipeline engine stopped");
        Ok(())
    }
}
