use std::path::PathBuf;
use thiserror::Error;

use crate::model::Phase;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// A request that refers to state the engine cannot act on. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Product '{0}' does not exist")]
    ProductNotFound(String),

    #[error("No executor registered for {0}")]
    ExecutorMissing(Phase),

    #[error("{phase} of product '{product_id}' cannot start before the previous phase completes")]
    PhaseBlocked { product_id: String, phase: Phase },

    #[error("Product '{product_id}' is {status}, expected {expected}")]
    InvalidProductState {
        product_id: String,
        status: String,
        expected: String,
    },

    #[error("Product '{0}' has no failed phase to retry")]
    NothingToRetry(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
