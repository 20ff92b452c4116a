use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParseEnumError, Phase};

/// Scheduling priority. Claims prefer `High`, then `Normal`, then `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// Sort key used by the claim query; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }
}

impl FromStr for JobPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(ParseEnumError::new("job priority", other)),
        }
    }
}

text_enum_sql!(JobPriority);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Pending and running jobs count against the one-active-job-per-phase rule.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}

text_enum_sql!(JobStatus);

/// The hold a caller must still have on a job to record its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLease<'a> {
    /// `running` and owned by this worker.
    Held(&'a str),
    /// Expired by the reaper; `failed` with no live owner.
    Expired,
}

impl<'a> JobLease<'a> {
    pub fn expected_status(self) -> JobStatus {
        match self {
            JobLease::Held(_) => JobStatus::Running,
            JobLease::Expired => JobStatus::Failed,
        }
    }

    /// Worker the row must still name, if any.
    pub fn owner(self) -> Option<&'a str> {
        match self {
            JobLease::Held(worker_id) => Some(worker_id),
            JobLease::Expired => None,
        }
    }
}

impl fmt::Display for JobLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobLease::Held(worker_id) => write!(f, "held by {}", worker_id),
            JobLease::Expired => f.write_str("expired"),
        }
    }
}

/// A scheduled unit of work for one (product, phase) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub product_id: String,
    pub phase: Phase,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BackgroundJob {
    /// New pending job, claimable immediately.
    pub fn pending(
        product_id: impl Into<String>,
        phase: Phase,
        priority: JobPriority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            product_id: product_id.into(),
            phase,
            priority,
            status: JobStatus::Pending,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            worker_id: None,
            error_message: None,
            created_at: now,
        }
    }

    /// Attempt number of the next (or current) execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}
