use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::WorkerConfig;
use crate::context::EngineContext;
use crate::error::ValidationError;
use crate::events::PipelineEvent;
use crate::executor::{ExecutionContext, ExecutorError, ExecutorRegistry, ProgressReporter};
use crate::model::{BackgroundJob, JobLease, LogAction, LogLevel, PhaseOutput, PipelineLog};
use crate::queue::FailureOutcome;
use crate::store::StoreResult;

/// How a single claimed job ended from this worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The phase was already completed; the job was closed without executing.
    AlreadyCompleted,
    RetryScheduled,
    PermanentlyFailed,
    /// Invalid job, failed without retry.
    Dropped,
    /// Another party took the job over while it ran.
    LeaseLost,
}

/// Bounded-concurrency polling loop that claims jobs and runs executors.
///
/// Several pools (in one process or many) may share a store; the claim is
/// the only coordination between them.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerShared>,
}

struct WorkerShared {
    worker_id: String,
    ctx: EngineContext,
    executors: ExecutorRegistry,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(ctx: EngineContext, executors: ExecutorRegistry, config: WorkerConfig) -> Self {
        let worker_id = format!("{}-{}", config.name, uuid::Uuid::new_v4());
        Self {
            inner: Arc::new(WorkerShared {
                worker_id,
                ctx,
                executors,
                config,
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Spawns the polling loop; it stops when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    }

    /// Polls until `cancel` fires, then waits up to the shutdown timeout for
    /// in-flight jobs. Jobs still running after that are left to the reaper.
    pub async fn run(&self, cancel: CancellationToken) {
        let config = &self.inner.config;
        info!(
            "Worker {} started (concurrency {}, poll every {:?})",
            self.worker_id(),
            config.concurrency,
            config.poll_interval()
        );

        let executions = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join_error(joined);
                }
            }
            self.fill(&mut tasks, &executions).await;
        }

        info!(
            "Worker {} stopping, waiting for {} in-flight job(s)",
            self.worker_id(),
            tasks.len()
        );
        let drained = tokio::time::timeout(config.shutdown_timeout(), async {
            while let Some(joined) = tasks.join_next().await {
                log_join_error(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Worker {} abandoning {} job(s) after {:?}; the reaper will recover them",
                self.worker_id(),
                tasks.len(),
                config.shutdown_timeout()
            );
            executions.cancel();
            tasks.abort_all();
        }
        info!("Worker {} stopped", self.worker_id());
    }

    /// Processes claimable work until none is left, then returns how many
    /// jobs were handled. Retries that are already due are picked up too.
    pub async fn run_until_idle(&self) -> usize {
        let executions = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut handled = 0;

        loop {
            handled += self.fill(&mut tasks, &executions).await;
            match tasks.join_next().await {
                Some(joined) => log_join_error(joined),
                None => break,
            }
        }
        handled
    }

    /// Claims jobs until the concurrency ceiling is reached or nothing is due.
    async fn fill(&self, tasks: &mut JoinSet<()>, executions: &CancellationToken) -> usize {
        let mut claimed = 0;
        while tasks.len() < self.inner.config.concurrency {
            match self.inner.ctx.scheduler.claim_next(self.worker_id()).await {
                Ok(Some(job)) => {
                    let shared = Arc::clone(&self.inner);
                    let cancel = executions.child_token();
                    tasks.spawn(async move {
                        let job_id = job.id.clone();
                        if let Err(e) = shared.process(job, cancel).await {
                            error!("Job {} aborted by storage error: {}", job_id, e);
                        }
                    });
                    claimed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Worker {} failed to claim: {}", self.worker_id(), e);
                    break;
                }
            }
        }
        claimed
    }

    /// Runs one already-claimed job to its outcome.
    pub async fn process(&self, job: BackgroundJob) -> StoreResult<JobOutcome> {
        self.inner.process(job, CancellationToken::new()).await
    }
}

impl WorkerShared {
    async fn process(&self, job: BackgroundJob, cancel: CancellationToken) -> StoreResult<JobOutcome> {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            product_id = %job.product_id,
            phase = job.phase.number(),
            attempt = job.attempt(),
            worker = %self.worker_id,
        );
        self.process_inner(job, cancel).instrument(span).await
    }

    async fn process_inner(&self, job: BackgroundJob, cancel: CancellationToken) -> StoreResult<JobOutcome> {
        let ctx = &self.ctx;

        if ctx.store.get_product(&job.product_id).await?.is_none() {
            return self
                .drop_job(&job, ValidationError::ProductNotFound(job.product_id.clone()))
                .await;
        }
        let Some(executor) = self.executors.get(job.phase) else {
            return self.drop_job(&job, ValidationError::ExecutorMissing(job.phase)).await;
        };

        if !ctx.machine.start_phase(&job.product_id, job.phase).await? {
            let completed = ctx
                .store
                .get_phase(&job.product_id, job.phase)
                .await?
                .is_some_and(|p| p.is_completed());
            if completed {
                debug!("{} already completed, closing job {}", job.phase, job.id);
                ctx.store.complete_job(&job.id, &self.worker_id).await?;
                ctx.machine
                    .advance(&job.product_id, job.phase, job.priority)
                    .await?;
                return Ok(JobOutcome::AlreadyCompleted);
            }
            return self
                .drop_job(
                    &job,
                    ValidationError::PhaseBlocked {
                        product_id: job.product_id.clone(),
                        phase: job.phase,
                    },
                )
                .await;
        }

        ctx.journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Info,
                    LogAction::StartPhase,
                    format!("Attempt {} on {}", job.attempt(), self.worker_id),
                )
                .with_job(job.id.as_str()),
            )
            .await;
        ctx.events.send(PipelineEvent::PhaseStarted {
            product_id: job.product_id.clone(),
            phase: job.phase,
            job_id: job.id.clone(),
            attempt: job.attempt(),
            timestamp: Utc::now(),
        });

        let exec_ctx = ExecutionContext {
            product_id: job.product_id.clone(),
            phase: job.phase,
            job_id: job.id.clone(),
            attempt: job.attempt(),
            cancel: cancel.clone(),
            progress: ProgressReporter::new(
                Arc::clone(&ctx.store),
                ctx.events.clone(),
                job.product_id.as_str(),
                job.phase,
            ),
        };

        let timeout = self.config.executor_timeout();
        let execution = AssertUnwindSafe(executor.execute(&exec_ctx)).catch_unwind();
        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ExecutorError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => {
                cancel.cancel();
                Err(ExecutorError::TimedOut(timeout))
            }
        };

        match result {
            Ok(payload) => self.succeed(&job, payload).await,
            Err(e) => self.fail(&job, e).await,
        }
    }

    async fn succeed(&self, job: &BackgroundJob, payload: serde_json::Value) -> StoreResult<JobOutcome> {
        let ctx = &self.ctx;
        ctx.store
            .save_phase_output(&PhaseOutput {
                product_id: job.product_id.clone(),
                phase: job.phase,
                payload,
                created_at: Utc::now(),
            })
            .await?;

        if !ctx.store.complete_job(&job.id, &self.worker_id).await? {
            warn!(
                "Worker {} lost the lease on job {} before completing it",
                self.worker_id, job.id
            );
            return Ok(JobOutcome::LeaseLost);
        }

        ctx.machine
            .complete_phase(&job.product_id, job.phase, job.priority)
            .await?;
        ctx.journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Info,
                    LogAction::CompletePhase,
                    format!("{} completed on attempt {}", job.phase, job.attempt()),
                )
                .with_job(job.id.as_str()),
            )
            .await;
        Ok(JobOutcome::Completed)
    }

    async fn fail(&self, job: &BackgroundJob, err: ExecutorError) -> StoreResult<JobOutcome> {
        let message = err.to_string();
        self.ctx
            .journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Error,
                    LogAction::PhaseError,
                    format!("Attempt {} failed: {}", job.attempt(), message),
                )
                .with_job(job.id.as_str()),
            )
            .await;

        let outcome = self
            .ctx
            .retry
            .handle_failure(job, &message, JobLease::Held(&self.worker_id))
            .await?;
        Ok(match outcome {
            FailureOutcome::Rescheduled { .. } => JobOutcome::RetryScheduled,
            FailureOutcome::PermanentlyFailed { .. } => JobOutcome::PermanentlyFailed,
            FailureOutcome::Superseded => JobOutcome::LeaseLost,
        })
    }

    /// Fails the job without retry. Phase and product rows are left alone.
    async fn drop_job(&self, job: &BackgroundJob, reason: ValidationError) -> StoreResult<JobOutcome> {
        let message = reason.to_string();
        if !self
            .ctx
            .store
            .fail_job(&job.id, JobLease::Held(&self.worker_id), job.retry_count, &message)
            .await?
        {
            debug!("Job {} was reclaimed, not dropping it", job.id);
            return Ok(JobOutcome::LeaseLost);
        }
        self.ctx
            .journal
            .record(
                PipelineLog::new(
                    job.product_id.as_str(),
                    Some(job.phase),
                    LogLevel::Warn,
                    LogAction::ValidationError,
                    format!("Dropped job: {}", message),
                )
                .with_job(job.id.as_str()),
            )
            .await;
        Ok(JobOutcome::Dropped)
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Worker task panicked: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
