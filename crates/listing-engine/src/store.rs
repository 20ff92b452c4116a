//! The persistence contract the engine runs against.
//!
//! Every method that changes job ownership or phase status is one guarded
//! write; its `bool` result says whether the guard matched. Callers treat
//! `false` as "somebody else already moved this row" and never retry the
//! same write blindly.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{
    job_repo, log_repo, output_repo, phase_repo, product_repo, Database, DatabaseError,
};
use crate::model::{
    BackgroundJob, JobLease, Phase, PhaseOutput, PipelineLog, PipelinePhase, Product,
    ProductStatusChange,
};

pub type StoreResult<T> = std::result::Result<T, DatabaseError>;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    // Products

    /// Creates the product and its four phase rows. `false` if it already existed.
    async fn create_product(&self, product: &Product) -> StoreResult<bool>;
    async fn get_product(&self, id: &str) -> StoreResult<Option<Product>>;
    async fn list_products_in_flight(&self) -> StoreResult<Vec<Product>>;
    async fn update_product_status(&self, id: &str, change: &ProductStatusChange) -> StoreResult<bool>;
    async fn advance_current_phase(&self, id: &str, phase: Phase) -> StoreResult<bool>;

    // Phases

    async fn get_phase(&self, product_id: &str, phase: Phase) -> StoreResult<Option<PipelinePhase>>;
    async fn list_phases(&self, product_id: &str) -> StoreResult<Vec<PipelinePhase>>;
    async fn upsert_phase(&self, phase: &PipelinePhase) -> StoreResult<()>;
    /// Guarded on the previous phase being completed and no other phase running.
    async fn start_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool>;
    async fn complete_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool>;
    async fn fail_phase(
        &self,
        product_id: &str,
        phase: Phase,
        error: &str,
        retry_count: u32,
        terminal: bool,
    ) -> StoreResult<bool>;
    async fn reset_failed_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool>;
    async fn update_phase_progress(&self, product_id: &str, phase: Phase, percentage: u8) -> StoreResult<bool>;

    // Jobs

    /// `false` when an active job for the same (product, phase) already exists.
    async fn insert_job(&self, job: &BackgroundJob) -> StoreResult<bool>;
    async fn get_job(&self, id: &str) -> StoreResult<Option<BackgroundJob>>;
    async fn active_job(&self, product_id: &str, phase: Phase) -> StoreResult<Option<BackgroundJob>>;
    async fn latest_job(&self, product_id: &str, phase: Phase) -> StoreResult<Option<BackgroundJob>>;
    async fn list_jobs(&self, product_id: &str) -> StoreResult<Vec<BackgroundJob>>;
    async fn find_claimable_job(&self, now: DateTime<Utc>) -> StoreResult<Option<BackgroundJob>>;
    /// `pending -> running`. `None` when the job was no longer pending.
    async fn claim_job(&self, id: &str, worker_id: &str) -> StoreResult<Option<BackgroundJob>>;
    async fn complete_job(&self, id: &str, worker_id: &str) -> StoreResult<bool>;
    /// Releases the lease back to `pending`; `false` when `lease` no longer holds.
    async fn reschedule_job(
        &self,
        id: &str,
        lease: JobLease<'_>,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool>;
    async fn fail_job(&self, id: &str, lease: JobLease<'_>, retry_count: u32, error: &str) -> StoreResult<bool>;
    async fn expire_job(&self, id: &str, cutoff: DateTime<Utc>, error: &str) -> StoreResult<bool>;
    async fn find_stale_jobs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<BackgroundJob>>;

    // Audit log and outputs

    async fn insert_log(&self, entry: &PipelineLog) -> StoreResult<()>;
    async fn list_logs(&self, product_id: &str) -> StoreResult<Vec<PipelineLog>>;
    async fn save_phase_output(&self, output: &PhaseOutput) -> StoreResult<()>;
    async fn get_phase_output(&self, product_id: &str, phase: Phase) -> StoreResult<Option<PhaseOutput>>;
}

/// `PipelineStore` over a SQLite file.
///
/// Each instance owns one connection. Several instances opened on the same
/// file behave like separate worker processes.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    pub fn from_database(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn create_product(&self, product: &Product) -> StoreResult<bool> {
        product_repo::insert_with_phases(&self.db, product)
    }

    async fn get_product(&self, id: &str) -> StoreResult<Option<Product>> {
        product_repo::find_by_id(&self.db, id)
    }

    async fn list_products_in_flight(&self) -> StoreResult<Vec<Product>> {
        product_repo::list_in_flight(&self.db)
    }

    async fn update_product_status(&self, id: &str, change: &ProductStatusChange) -> StoreResult<bool> {
        product_repo::update_status(&self.db, id, change, Utc::now())
    }

    async fn advance_current_phase(&self, id: &str, phase: Phase) -> StoreResult<bool> {
        product_repo::advance_current_phase(&self.db, id, phase, Utc::now())
    }

    async fn get_phase(&self, product_id: &str, phase: Phase) -> StoreResult<Option<PipelinePhase>> {
        phase_repo::find(&self.db, product_id, phase)
    }

    async fn list_phases(&self, product_id: &str) -> StoreResult<Vec<PipelinePhase>> {
        phase_repo::list_for_product(&self.db, product_id)
    }

    async fn upsert_phase(&self, phase: &PipelinePhase) -> StoreResult<()> {
        phase_repo::upsert(&self.db, phase)
    }

    async fn start_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        phase_repo::start(&self.db, product_id, phase, Utc::now())
    }

    async fn complete_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        phase_repo::complete(&self.db, product_id, phase, Utc::now())
    }

    async fn fail_phase(
        &self,
        product_id: &str,
        phase: Phase,
        error: &str,
        retry_count: u32,
        terminal: bool,
    ) -> StoreResult<bool> {
        phase_repo::record_failure(&self.db, product_id, phase, error, retry_count, terminal, Utc::now())
    }

    async fn reset_failed_phase(&self, product_id: &str, phase: Phase) -> StoreResult<bool> {
        phase_repo::reset_failed(&self.db, product_id, phase, Utc::now())
    }

    async fn update_phase_progress(&self, product_id: &str, phase: Phase, percentage: u8) -> StoreResult<bool> {
        phase_repo::update_progress(&self.db, product_id, phase, percentage, Utc::now())
    }

    async fn insert_job(&self, job: &BackgroundJob) -> StoreResult<bool> {
        job_repo::insert(&self.db, job)
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<BackgroundJob>> {
        job_repo::find_by_id(&self.db, id)
    }

    async fn active_job(&self, product_id: &str, phase: Phase) -> StoreResult<Option<BackgroundJob>> {
        job_repo::find_active(&self.db, product_id, phase)
    }

    async fn latest_job(&self, product_id: &str, phase: Phase) -> StoreResult<Option<BackgroundJob>> {
        job_repo::find_latest(&self.db, product_id, phase)
    }

    async fn list_jobs(&self, product_id: &str) -> StoreResult<Vec<BackgroundJob>> {
        job_repo::list_for_product(&self.db, product_id)
    }

    async fn find_claimable_job(&self, now: DateTime<Utc>) -> StoreResult<Option<BackgroundJob>> {
        job_repo::find_claimable(&self.db, now)
    }

    async fn claim_job(&self, id: &str, worker_id: &str) -> StoreResult<Option<BackgroundJob>> {
        job_repo::claim(&self.db, id, worker_id, Utc::now())
    }

    async fn complete_job(&self, id: &str, worker_id: &str) -> StoreResult<bool> {
        job_repo::complete(&self.db, id, worker_id, Utc::now())
    }

    async fn reschedule_job(
        &self,
        id: &str,
        lease: JobLease<'_>,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        job_repo::reschedule(&self.db, id, lease, retry_count, scheduled_at, error, Utc::now())
    }

    async fn fail_job(&self, id: &str, lease: JobLease<'_>, retry_count: u32, error: &str) -> StoreResult<bool> {
        job_repo::fail(&self.db, id, lease, retry_count, error, Utc::now())
    }

    async fn expire_job(&self, id: &str, cutoff: DateTime<Utc>, error: &str) -> StoreResult<bool> {
        job_repo::expire(&self.db, id, cutoff, error, Utc::now())
    }

    async fn find_stale_jobs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<BackgroundJob>> {
        job_repo::find_stale(&self.db, cutoff)
    }

    async fn insert_log(&self, entry: &PipelineLog) -> StoreResult<()> {
        log_repo::insert(&self.db, entry)
    }

    async fn list_logs(&self, product_id: &str) -> StoreResult<Vec<PipelineLog>> {
        log_repo::list_for_product(&self.db, product_id)
    }

    async fn save_phase_output(&self, output: &PhaseOutput) -> StoreResult<()> {
        output_repo::upsert(&self.db, output)
    }

    async fn get_phase_output(&self, product_id: &str, phase: Phase) -> StoreResult<Option<PhaseOutput>> {
        output_repo::find(&self.db, product_id, phase)
    }
}
