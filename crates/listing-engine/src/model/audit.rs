//! Append-only pipeline audit entries.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParseEnumError, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ParseEnumError::new("log level", other)),
        }
    }
}

text_enum_sql!(LogLevel);

/// What the engine was doing when it wrote the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Enqueue,
    StartPhase,
    CompletePhase,
    PhaseError,
    RetryScheduled,
    PermanentFailure,
    TimeoutCleanup,
    ValidationError,
    ReconcilePhase,
    ManualRetry,
    Pause,
    Resume,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Enqueue => "enqueue",
            LogAction::StartPhase => "start_phase",
            LogAction::CompletePhase => "complete_phase",
            LogAction::PhaseError => "phase_error",
            LogAction::RetryScheduled => "retry_scheduled",
            LogAction::PermanentFailure => "permanent_failure",
            LogAction::TimeoutCleanup => "timeout_cleanup",
            LogAction::ValidationError => "validation_error",
            LogAction::ReconcilePhase => "reconcile_phase",
            LogAction::ManualRetry => "manual_retry",
            LogAction::Pause => "pause",
            LogAction::Resume => "resume",
        }
    }
}

impl FromStr for LogAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue" => Ok(LogAction::Enqueue),
            "start_phase" => Ok(LogAction::StartPhase),
            "complete_phase" => Ok(LogAction::CompletePhase),
            "phase_error" => Ok(LogAction::PhaseError),
            "retry_scheduled" => Ok(LogAction::RetryScheduled),
            "permanent_failure" => Ok(LogAction::PermanentFailure),
            "timeout_cleanup" => Ok(LogAction::TimeoutCleanup),
            "validation_error" => Ok(LogAction::ValidationError),
            "reconcile_phase" => Ok(LogAction::ReconcilePhase),
            "manual_retry" => Ok(LogAction::ManualRetry),
            "pause" => Ok(LogAction::Pause),
            "resume" => Ok(LogAction::Resume),
            other => Err(ParseEnumError::new("log action", other)),
        }
    }
}

text_enum_sql!(LogAction);

/// Immutable once written. Never read back to drive control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLog {
    pub product_id: String,
    pub phase: Option<Phase>,
    pub job_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub action: LogAction,
    pub created_at: DateTime<Utc>,
}

impl PipelineLog {
    pub fn new(
        product_id: impl Into<String>,
        phase: Option<Phase>,
        level: LogLevel,
        action: LogAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            phase,
            job_id: None,
            level,
            message: message.into(),
            action,
            created_at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_action_names() {
        assert_eq!(LogAction::TimeoutCleanup.as_str(), "timeout_cleanup");
        assert_eq!(
            "phase_error".parse::<LogAction>().unwrap(),
            LogAction::PhaseError
        );
        assert!("explode".parse::<LogAction>().is_err());
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
