use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParseEnumError, Phase};

/// Status of one phase of one product.
///
/// `pending -> running -> completed | failed`, and `failed -> pending` when a
/// retry is scheduled or a manual re-trigger happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            other => Err(ParseEnumError::new("phase status", other)),
        }
    }
}

text_enum_sql!(PhaseStatus);

/// Row keyed by (product_id, phase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePhase {
    pub product_id: String,
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Stored hint only. Start decisions are derived from the previous
    /// phase's status.
    pub can_start: bool,
    pub progress_percentage: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelinePhase {
    /// Initial row as created at upload time.
    pub fn initial(product_id: impl Into<String>, phase: Phase, now: DateTime<Utc>) -> Self {
        Self {
            product_id: product_id.into(),
            phase,
            status: PhaseStatus::Pending,
            can_start: phase == Phase::FIRST,
            progress_percentage: 0,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }
}

/// Persisted executor output for one phase, stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub product_id: String,
    pub phase: Phase,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_phase_rows() {
        let now = Utc::now();
        let first = PipelinePhase::initial("p", Phase::Recognition, now);
        let second = PipelinePhase::initial("p", Phase::MarketResearch, now);
        assert!(first.can_start);
        assert!(!second.can_start);
        assert_eq!(second.status, PhaseStatus::Pending);
        assert_eq!(second.progress_percentage, 0);
    }

    #[test]
    fn test_phase_status_parse() {
        assert_eq!("running".parse::<PhaseStatus>().unwrap(), PhaseStatus::Running);
        assert_eq!(PhaseStatus::Failed.to_string(), "failed");
        assert!("Running".parse::<PhaseStatus>().is_err());
    }
}
