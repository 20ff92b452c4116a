use std::sync::Arc;

use crate::events::EventBroadcaster;
use crate::journal::Journal;
use crate::phase::PhaseStateMachine;
use crate::queue::{JobScheduler, RetryController, RetryPolicy};
use crate::store::PipelineStore;

/// Collaborators shared by the worker pool, the reaper and the reconciler.
///
/// Cheap to clone; everything inside is reference counted.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn PipelineStore>,
    pub journal: Journal,
    pub events: EventBroadcaster,
    pub scheduler: JobScheduler,
    pub machine: PhaseStateMachine,
    pub retry: RetryController,
}

impl EngineContext {
    pub fn new(store: Arc<dyn PipelineStore>, events: EventBroadcaster, policy: RetryPolicy) -> Self {
        let journal = Journal::new(Arc::clone(&store));
        let scheduler = JobScheduler::new(Arc::clone(&store), journal.clone(), policy.max_retries);
        let machine = PhaseStateMachine::new(Arc::clone(&store), scheduler.clone(), events.clone());
        let retry = RetryController::new(Arc::clone(&store), journal.clone(), events.clone(), policy);
        Self {
            store,
            journal,
            events,
            scheduler,
            machine,
            retry,
        }
    }
}
