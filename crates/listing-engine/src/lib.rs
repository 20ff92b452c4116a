pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod journal;
pub mod logging;
pub mod model;
pub mod phase;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod worker;

pub use config::{load_config, load_config_from_str, ConfigFormat, EngineConfig};
pub use context::EngineContext;
pub use db::{Database, DatabaseError};
pub use engine::{EngineHandle, PipelineEngine, StuckPhaseFix};
pub use error::{ConfigError, EngineError, Result, ValidationError};
pub use events::{EventBroadcaster, PipelineEvent};
pub use executor::{ExecutionContext, ExecutorError, ExecutorRegistry, PhaseExecutor, ProgressReporter};
pub use logging::init_logging;
pub use model::{
    BackgroundJob, JobLease, JobPriority, JobStatus, LogAction, LogLevel, Phase, PhaseOutput,
    PhaseStatus, PipelineLog, PipelinePhase, Product, ProductStatus,
};
pub use phase::{Advance, PhaseStateMachine};
pub use queue::{EnqueueOutcome, FailureOutcome, JobScheduler, RetryPolicy};
pub use recovery::{PhaseReconciler, ReapReport, ReconcileReport, StaleJobReaper};
pub use store::{PipelineStore, SqliteStore};
pub use worker::{JobOutcome, WorkerPool};
