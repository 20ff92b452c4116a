//! Job queue: idempotent enqueue and race-safe claiming.

pub mod retry;

use std::sync::Arc;

use chrono::Utc;

use crate::journal::Journal;
use crate::model::{BackgroundJob, JobPriority, LogAction, LogLevel, Phase, PipelineLog};
use crate::store::{PipelineStore, StoreResult};

pub use retry::{FailureOutcome, RetryController, RetryPolicy};

/// How many times `claim_next` re-selects after losing a claim race before
/// yielding until the next poll.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Result of an enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(BackgroundJob),
    /// A pending or running job already covers this (product, phase).
    AlreadyActive,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn PipelineStore>,
    journal: Journal,
    max_retries: u32,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn PipelineStore>, journal: Journal, max_retries: u32) -> Self {
        Self {
            store,
            journal,
            max_retries,
        }
    }

    /// Inserts a pending job due now, unless one is already active.
    pub async fn enqueue(
        &self,
        product_id: &str,
        phase: Phase,
        priority: JobPriority,
    ) -> StoreResult<EnqueueOutcome> {
        self.enqueue_with_retries(product_id, phase, priority, self.max_retries)
            .await
    }

    pub async fn enqueue_with_retries(
        &self,
        product_id: &str,
        phase: Phase,
        priority: JobPriority,
        max_retries: u32,
    ) -> StoreResult<EnqueueOutcome> {
        let job = BackgroundJob::pending(product_id, phase, priority, max_retries, Utc::now());
        if !self.store.insert_job(&job).await? {
            log::debug!(
                "Skipping enqueue of {} for '{}': job already active",
                phase,
                product_id
            );
            return Ok(EnqueueOutcome::AlreadyActive);
        }

        self.journal
            .record(
                PipelineLog::new(
                    product_id,
                    Some(phase),
                    LogLevel::Info,
                    LogAction::Enqueue,
                    format!("Enqueued with {} priority", priority),
                )
                .with_job(job.id.as_str()),
            )
            .await;

        Ok(EnqueueOutcome::Enqueued(job))
    }

    /// Claims the next due job for `worker_id`.
    ///
    /// Selection and claim are separate statements; the claim is guarded on
    /// `status = 'pending'` so a lost race just means selecting again.
    pub async fn claim_next(&self, worker_id: &str) -> StoreResult<Option<BackgroundJob>> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let Some(candidate) = self.store.find_claimable_job(Utc::now()).await? else {
                return Ok(None);
            };

            if let Some(job) = self.store.claim_job(&candidate.id, worker_id).await? {
                log::debug!(
                    "Worker {} claimed job {} ({} of '{}')",
                    worker_id,
                    job.id,
                    job.phase,
                    job.product_id
                );
                return Ok(Some(job));
            }

            log::debug!(
                "Worker {} lost claim race for job {}, reselecting",
                worker_id,
                candidate.id
            );
        }
        Ok(None)
    }
}
