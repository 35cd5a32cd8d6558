//! Job records: one schedulable automation action belonging to a run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::Action;

/// Scheduling priority. Declaration order is ascending urgency, so the
/// derived `Ord` ranks `Urgent` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses eligible for dequeue once `not_before` passes.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// One schedulable unit of device automation, owned by its parent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Device the parent run is assigned to.
    pub udid: String,
    pub action: Action,
    pub priority: JobPriority,
    /// Earliest dispatch time; pushed forward on retry.
    pub not_before: DateTime<Utc>,
    /// Latest useful dispatch time; past this the job fails instead of
    /// dispatching.
    pub deadline: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        run_id: Uuid,
        udid: impl Into<String>,
        action: Action,
        priority: JobPriority,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            udid: udid.into(),
            action,
            priority,
            not_before: Utc::now(),
            deadline: None,
            attempts: 0,
            max_attempts,
            status: JobStatus::Pending,
            result: None,
            error_text: None,
            created_at: Utc::now(),
        }
    }
}

/// Retry delay for the given attempt count: exponential backoff, base 2,
/// capped.
pub fn retry_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(cap)
}
