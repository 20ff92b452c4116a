//! Phase executors: the caller-supplied work behind each phase.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBroadcaster, PipelineEvent};
use crate::model::Phase;
use crate::store::PipelineStore;

/// Errors an execution can end with. All of them are retryable.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("Executor timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Executor cancelled")]
    Cancelled,

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutorError::Failed(message.into())
    }
}

/// Computes the output of one phase for one product.
///
/// The returned payload is stored verbatim. Implementations should watch
/// `ctx.cancel` around long outbound calls.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, ExecutorError>;
}

/// Everything an executor gets to know about the job it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub product_id: String,
    pub phase: Phase,
    pub job_id: String,
    /// 1 for the first execution, 2 for the first retry, ...
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("product_id", &self.product_id)
            .field("phase", &self.phase)
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Writes `progress_percentage` for the running phase and broadcasts it.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn PipelineStore>,
    events: EventBroadcaster,
    product_id: String,
    phase: Phase,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        events: EventBroadcaster,
        product_id: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self {
            store,
            events,
            product_id: product_id.into(),
            phase,
        }
    }

    /// Values above 100 are clamped. Ignored once the phase stops running.
    pub async fn report(&self, percentage: u8) {
        let percentage = percentage.min(100);
        match self
            .store
            .update_phase_progress(&self.product_id, self.phase, percentage)
            .await
        {
            Ok(true) => self.events.send(PipelineEvent::PhaseProgress {
                product_id: self.product_id.clone(),
                phase: self.phase,
                percentage,
                timestamp: Utc::now(),
            }),
            Ok(false) => log::debug!(
                "Dropped progress {}% for {} of '{}': phase not running",
                percentage,
                self.phase,
                self.product_id
            ),
            Err(e) => log::warn!(
                "Failed to record progress for {} of '{}': {}",
                self.phase,
                self.product_id,
                e
            ),
        }
    }
}

/// One executor per phase.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Phase, Arc<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `phase`, replacing any earlier one.
    pub fn register(&mut self, phase: Phase, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(phase, executor);
    }

    pub fn with(mut self, phase: Phase, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.register(phase, executor);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(&phase).cloned()
    }

    /// Phases with no registered executor, in pipeline order.
    pub fn missing(&self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| !self.executors.contains_key(p))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}
