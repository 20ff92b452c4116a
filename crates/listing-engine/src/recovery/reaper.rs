//! Recovers jobs whose worker died or hung.
//!
//! A job is stale when it has been `running` for longer than the threshold.
//! Expiring it is a guarded write, so a worker that finishes at the same
//! moment either wins (job completed) or loses (job expired), never both.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::context::EngineContext;
use crate::events::PipelineEvent;
use crate::model::{JobLease, LogAction, LogLevel, PipelineLog};
use crate::queue::FailureOutcome;
use crate::store::StoreResult;

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub expired: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct StaleJobReaper {
    ctx: EngineContext,
    stale_after: Duration,
}

impl StaleJobReaper {
    pub fn new(ctx: EngineContext, stale_after: Duration) -> Self {
        Self { ctx, stale_after }
    }

    /// Expires every stale job and routes it through the retry controller.
    pub async fn reap_once(&self) -> StoreResult<ReapReport> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(now);

        let mut report = ReapReport::default();
        for job in self.ctx.store.find_stale_jobs(cutoff).await? {
            let message = format!(
                "Job abandoned by worker {} (running longer than {}s)",
                job.worker_id.as_deref().unwrap_or("<unknown>"),
                self.stale_after.as_secs()
            );
            if !self.ctx.store.expire_job(&job.id, cutoff, &message).await? {
                continue;
            }
            report.expired += 1;

            self.ctx
                .journal
                .record(
                    PipelineLog::new(
                        job.product_id.as_str(),
                        Some(job.phase),
                        LogLevel::Warn,
                        LogAction::TimeoutCleanup,
                        message.as_str(),
                    )
                    .with_job(job.id.as_str()),
                )
                .await;
            self.ctx.events.send(PipelineEvent::JobReaped {
                product_id: job.product_id.clone(),
                phase: job.phase,
                job_id: job.id.clone(),
                worker_id: job.worker_id.clone(),
                timestamp: Utc::now(),
            });

            match self
                .ctx
                .retry
                .handle_failure(&job, &message, JobLease::Expired)
                .await?
            {
                FailureOutcome::Rescheduled { .. } => report.rescheduled += 1,
                FailureOutcome::PermanentlyFailed { .. } => report.failed += 1,
                FailureOutcome::Superseded => {}
            }
        }

        if report.expired > 0 {
            log::info!(
                "Reaper expired {} job(s): {} rescheduled, {} failed",
                report.expired,
                report.rescheduled,
                report.failed
            );
        }
        Ok(report)
    }

    /// Spawns a loop running `reap_once` every `interval` until cancelled.
    /// The first pass runs immediately.
    pub fn start(&self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                if let Err(e) = reaper.reap_once().await {
                    log::error!("Reaper pass failed: {}", e);
                }
            }
            log::debug!("Reaper stopped");
        })
    }
}
