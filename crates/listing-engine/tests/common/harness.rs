//! Test harness for isolated engine execution.
//!
//! Each `TestHarness` owns a temp directory holding one SQLite file. Extra
//! store handles on the same file stand in for separate worker processes.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, SecondsFormat, Utc};
use tempfile::TempDir;

use listing_engine::config::EngineConfig;
use listing_engine::{ExecutorRegistry, PipelineEngine, SqliteStore};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    /// Handle shared by engines built through `engine`.
    pub store: Arc<SqliteStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("pipeline.db");
        let store = Arc::new(SqliteStore::open(&db_path).expect("Failed to open store"));
        Self {
            temp_dir,
            db_path,
            store,
        }
    }

    /// Fast settings: no backoff, short poll interval.
    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database.path = Some(self.db_path.clone());
        config.worker.name = "test-worker".to_string();
        config.worker.poll_interval_ms = 10;
        config.worker.executor_timeout_secs = 5;
        config.worker.shutdown_timeout_secs = 1;
        config.retry.base_delay_ms = 0;
        config.retry.max_delay_ms = 0;
        config
    }

    /// Engine on the harness' shared store handle.
    pub fn engine(&self, executors: ExecutorRegistry) -> PipelineEngine {
        self.engine_with(executors, self.config())
    }

    pub fn engine_with(&self, executors: ExecutorRegistry, config: EngineConfig) -> PipelineEngine {
        PipelineEngine::new(self.store.clone(), executors, config).expect("Failed to build engine")
    }

    /// Engine on a fresh connection to the same file, like another process.
    pub fn separate_engine(&self, executors: ExecutorRegistry) -> PipelineEngine {
        let store = Arc::new(self.open_store());
        PipelineEngine::new(store, executors, self.config()).expect("Failed to build engine")
    }

    pub fn open_store(&self) -> SqliteStore {
        SqliteStore::open(&self.db_path).expect("Failed to open second store")
    }

    /// Moves a job's `started_at` into the past.
    pub fn backdate_job(&self, job_id: &str, by: Duration) {
        let started = (Utc::now() - by).to_rfc3339_opts(SecondsFormat::Micros, true);
        self.store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE background_jobs SET started_at = ?1 WHERE id = ?2",
                    rusqlite::params![started, job_id],
                )?;
                Ok(())
            })
            .expect("Failed to backdate job");
    }

    /// Rows changed through the shared handle since it was opened.
    pub fn total_changes(&self) -> i64 {
        self.store
            .database()
            .with_conn(|conn| Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?))
            .expect("Failed to read total_changes")
    }
}
