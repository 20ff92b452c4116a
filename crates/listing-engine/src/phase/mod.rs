//! Phase ordering and completion.
//!
//! Whether a phase may start is always derived from the previous phase's
//! stored status. The `can_start` column is only kept up to date as a hint
//! for readers outside the engine.

use std::sync::Arc;

use chrono::Utc;

use crate::events::{EventBroadcaster, PipelineEvent};
use crate::model::{JobPriority, Phase, PhaseStatus, ProductStatus, ProductStatusChange};
use crate::queue::{EnqueueOutcome, JobScheduler};
use crate::store::{PipelineStore, StoreResult};

/// What `advance` did after a phase completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// The next phase has a job (newly created or already active).
    NextPhase { phase: Phase, outcome: EnqueueOutcome },
    /// The next phase is already completed; nothing to schedule.
    NextAlreadyCompleted(Phase),
    /// Phase 4 completed and the product moved to `completed`.
    PipelineCompleted,
    /// Phase 4 completed but the product had already settled.
    AlreadySettled,
}

#[derive(Clone)]
pub struct PhaseStateMachine {
    store: Arc<dyn PipelineStore>,
    scheduler: JobScheduler,
    events: EventBroadcaster,
}

impl PhaseStateMachine {
    pub fn new(store: Arc<dyn PipelineStore>, scheduler: JobScheduler, events: EventBroadcaster) -> Self {
        Self {
            store,
            scheduler,
            events,
        }
    }

    /// True iff `phase` is the first phase or its predecessor is completed.
    pub async fn can_start(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        match phase.previous() {
            None => Ok(true),
            Some(previous) => Ok(self
                .store
                .get_phase(product_id, previous)
                .await?
                .is_some_and(|p| p.status == PhaseStatus::Completed)),
        }
    }

    /// `-> running` with progress reset. `false` when ordering forbids it or
    /// the phase is already completed.
    pub async fn start_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        let started = self.store.start_phase(product_id, phase).await?;
        if started {
            self.store
                .update_product_status(
                    product_id,
                    &ProductStatusChange::to(ProductStatus::Processing)
                        .only_from(&[ProductStatus::Uploading])
                        .running(true),
                )
                .await?;
        }
        Ok(started)
    }

    /// `-> completed` without any follow-up. `false` if it already was.
    pub async fn mark_completed(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        let completed = self.store.complete_phase(product_id, phase).await?;
        if completed {
            self.events.send(PipelineEvent::PhaseCompleted {
                product_id: product_id.to_string(),
                phase,
                timestamp: Utc::now(),
            });
        }
        Ok(completed)
    }

    /// Moves the pipeline past a completed `phase`.
    ///
    /// Enqueues the next phase unless it is already completed, or settles
    /// the product after the last phase. Safe to call more than once.
    pub async fn advance(
        &self,
        product_id: &str,
        phase: Phase,
        priority: JobPriority,
    ) -> StoreResult<Advance> {
        let Some(next) = phase.next() else {
            return self.finish_pipeline(product_id).await;
        };

        self.store.advance_current_phase(product_id, next).await?;

        let next_done = self
            .store
            .get_phase(product_id, next)
            .await?
            .is_some_and(|p| p.is_completed());
        if next_done {
            return Ok(Advance::NextAlreadyCompleted(next));
        }

        let outcome = self.scheduler.enqueue(product_id, next, priority).await?;
        Ok(Advance::NextPhase {
            phase: next,
            outcome,
        })
    }

    /// Marks `phase` completed and advances the pipeline.
    ///
    /// Returns whether this call performed the completion. Advancing runs
    /// either way so a crash between the two steps heals on the next call.
    pub async fn complete_phase(
        &self,
        product_id: &str,
        phase: Phase,
        priority: JobPriority,
    ) -> StoreResult<bool> {
        let completed = self.mark_completed(product_id, phase).await?;
        self.advance(product_id, phase, priority).await?;
        Ok(completed)
    }

    async fn finish_pipeline(&self, product_id: &str) -> StoreResult<Advance> {
        let change = ProductStatusChange::to(ProductStatus::Completed)
            .only_from(&[
                ProductStatus::Uploading,
                ProductStatus::Processing,
                ProductStatus::Paused,
                ProductStatus::Error,
            ])
            .running(false)
            .manual_review(false)
            .clear_error();
        if !self.store.update_product_status(product_id, &change).await? {
            return Ok(Advance::AlreadySettled);
        }

        log::info!("Pipeline completed for product '{}'", product_id);
        self.events.send(PipelineEvent::PipelineCompleted {
            product_id: product_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(Advance::PipelineCompleted)
    }
}
