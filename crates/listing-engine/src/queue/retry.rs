//! Retry and backoff for failed job executions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::events::{EventBroadcaster, PipelineEvent};
use crate::journal::Journal;
use crate::model::{
    BackgroundJob, JobLease, LogAction, LogLevel, PipelineLog, ProductStatus,
    ProductStatusChange,
};
use crate::store::{PipelineStore, StoreResult};

/// Exponential backoff: `base * 2^retry_count`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt that follows failure number `retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a job that has now failed `retry_count` times may run again.
    pub fn allows_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// What `handle_failure` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        retry_count: u32,
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// Retries exhausted. The product is flagged for manual review.
    PermanentlyFailed { retry_count: u32 },
    /// The caller's lease no longer holds; someone else owns or handled the job.
    Superseded,
}

#[derive(Clone)]
pub struct RetryController {
    store: Arc<dyn PipelineStore>,
    journal: Journal,
    events: EventBroadcaster,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        journal: Journal,
        events: EventBroadcaster,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            journal,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Routes a failed attempt to a delayed retry or to terminal failure.
    ///
    /// `lease` is the hold the caller must still have: `Held` by the worker
    /// reporting its own failure, `Expired` for a job the reaper expired. A
    /// worker whose job was reaped and claimed by someone else gets
    /// `Superseded` and changes nothing.
    pub async fn handle_failure(
        &self,
        job: &BackgroundJob,
        error: &str,
        lease: JobLease<'_>,
    ) -> StoreResult<FailureOutcome> {
        let retry_count = job.retry_count + 1;

        if RetryPolicy::allows_retry(retry_count, job.max_retries) {
            self.reschedule(job, error, lease, retry_count).await
        } else {
            self.fail_permanently(job, error, lease, retry_count).await
        }
    }

    async fn reschedule(
        &self,
        job: &BackgroundJob,
        error: &str,
        lease: JobLease<'_>,
        retry_count: u32,
    ) -> StoreResult<FailureOutcome> {
        let delay = self.policy.delay_for(retry_count);
        let now = Utc::now();
        let scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        if !self
            .store
            .reschedule_job(&job.id, lease, retry_count, scheduled_at, error)
            .await?
        {
            log::debug!("Job {} no longer {}, skipping reschedule", job.id, lease);
            return Ok(FailureOutcome::Superseded);
        }

        self.store
            .fail_phase(&job.product_id, job.phase, error, retry_count, false)
            .await?;

        self.journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Warn,
                    LogAction::RetryScheduled,
                    format!(
                        "Retry {}/{} in {}ms: {}",
                        retry_count,
                        job.max_retries,
                        delay.as_millis(),
                        error
                    ),
                )
                .with_job(job.id.as_str()),
            )
            .await;

        self.events.send(PipelineEvent::RetryScheduled {
            product_id: job.product_id.clone(),
            phase: job.phase,
            job_id: job.id.clone(),
            retry_count,
            scheduled_at,
            error: error.to_string(),
            timestamp: now,
        });

        Ok(FailureOutcome::Rescheduled {
            retry_count,
            delay,
            scheduled_at,
        })
    }

    async fn fail_permanently(
        &self,
        job: &BackgroundJob,
        error: &str,
        lease: JobLease<'_>,
        retry_count: u32,
    ) -> StoreResult<FailureOutcome> {
        if !self
            .store
            .fail_job(&job.id, lease, retry_count, error)
            .await?
        {
            log::debug!("Job {} no longer {}, skipping terminal failure", job.id, lease);
            return Ok(FailureOutcome::Superseded);
        }

        self.store
            .fail_phase(&job.product_id, job.phase, error, retry_count, true)
            .await?;

        let message = format!("{} failed after {} attempts: {}", job.phase, retry_count, error);
        let change = ProductStatusChange::to(ProductStatus::Error)
            .only_from(&[
                ProductStatus::Uploading,
                ProductStatus::Processing,
                ProductStatus::Paused,
            ])
            .running(false)
            .manual_review(true)
            .error(message.as_str());
        self.store
            .update_product_status(&job.product_id, &change)
            .await?;

        self.journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Error,
                    LogAction::PermanentFailure,
                    message,
                )
                .with_job(job.id.as_str()),
            )
            .await;

        self.events.send(PipelineEvent::PhaseFailed {
            product_id: job.product_id.clone(),
            phase: job.phase,
            job_id: job.id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        Ok(FailureOutcome::PermanentlyFailed { retry_count })
    }
}
