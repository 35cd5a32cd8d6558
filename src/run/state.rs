//! Run records and the run lifecycle state machine.
//!
//! `queued → running → {success, error, stopped}`, with `running ⇄ paused`
//! as the only reversible transition. Terminal states never transition
//! again; every transition goes through `transition_to` so invalid moves
//! are rejected instead of silently applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::Template;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Stopped,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Success | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Whether a run may move from one status to another.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    match from {
        RunStatus::Queued => matches!(to, RunStatus::Running | RunStatus::Stopped),
        RunStatus::Running => matches!(
            to,
            RunStatus::Paused | RunStatus::Stopped | RunStatus::Success | RunStatus::Error
        ),
        RunStatus::Paused => matches!(
            to,
            RunStatus::Running | RunStatus::Stopped | RunStatus::Error
        ),
        RunStatus::Stopped | RunStatus::Success | RunStatus::Error => false,
    }
}

/// One execution of a template against one device.
///
/// Owns a snapshot of its job ids taken at start time; progress is derived
/// from job terminal counts, never tracked separately, so the two can't
/// drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// Copy of the template taken at start; later template edits don't
    /// affect this run.
    pub template: Template,
    pub udid: String,
    pub account_id: Option<String>,
    pub status: RunStatus,
    pub progress_pct: u8,
    pub current_step: u32,
    pub total_steps: u32,
    pub last_action: Option<String>,
    pub error_text: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub job_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(template: Template, udid: impl Into<String>, account_id: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            template,
            udid: udid.into(),
            account_id,
            status: RunStatus::Queued,
            progress_pct: 0,
            current_step: 0,
            total_steps: 0,
            last_action: None,
            error_text: None,
            started_at: None,
            finished_at: None,
            job_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Apply a guarded status transition, stamping `started_at` /
    /// `finished_at` as the run enters and leaves execution.
    pub fn transition_to(&mut self, to: RunStatus) -> Result<(), String> {
        if !can_transition(self.status, to) {
            return Err(format!("invalid transition: {} -> {}", self.status, to));
        }
        if to == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = to;
        Ok(())
    }

    /// Record derived progress. The percentage is clamped to be monotone
    /// while the run executes.
    pub fn record_progress(&mut self, pct: u8, step: u32, last_action: Option<String>) {
        self.progress_pct = self.progress_pct.max(pct.min(100));
        self.current_step = step;
        if last_action.is_some() {
            self.last_action = last_action;
        }
    }

    /// Point-in-time view for the control surface and notifications.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            status: self.status,
            progress_pct: self.progress_pct,
            current_step: self.current_step,
            total_steps: self.total_steps,
            last_action: self.last_action.clone(),
            error_text: self.error_text.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Status view returned by `RunExecutor::status` and embedded in events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub progress_pct: u8,
    pub current_step: u32,
    pub total_steps: u32,
    pub last_action: Option<String>,
    pub error_text: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ActionQuotas, Template};

    fn record() -> RunRecord {
        let template = Template::new("instagram", ActionQuotas::default(), 10);
        RunRecord::new(template, "udid-1", None)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut run = record();
        run.transition_to(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition_to(RunStatus::Success).unwrap();
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_pause_is_reversible() {
        let mut run = record();
        run.transition_to(RunStatus::Running).unwrap();
        run.transition_to(RunStatus::Paused).unwrap();
        run.transition_to(RunStatus::Running).unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunStatus::Stopped, RunStatus::Success, RunStatus::Error] {
            for to in [
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::Paused,
                RunStatus::Stopped,
                RunStatus::Success,
                RunStatus::Error,
            ] {
                assert!(!can_transition(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn test_queued_cannot_pause_or_succeed() {
        assert!(!can_transition(RunStatus::Queued, RunStatus::Paused));
        assert!(!can_transition(RunStatus::Queued, RunStatus::Success));
        assert!(!can_transition(RunStatus::Queued, RunStatus::Error));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut run = record();
        let err = run.transition_to(RunStatus::Success).unwrap_err();
        assert!(err.contains("invalid transition"));
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut run = record();
        run.transition_to(RunStatus::Running).unwrap();
        run.record_progress(40, 2, Some("like".to_string()));
        run.record_progress(20, 3, Some("scroll".to_string()));

        assert_eq!(run.progress_pct, 40);
        assert_eq!(run.current_step, 3);
        assert_eq!(run.last_action.as_deref(), Some("scroll"));
    }

    #[test]
    fn test_started_at_survives_pause_resume() {
        let mut run = record();
        run.transition_to(RunStatus::Running).unwrap();
        let started = run.started_at;
        run.transition_to(RunStatus::Paused).unwrap();
        run.transition_to(RunStatus::Running).unwrap();
        assert_eq!(run.started_at, started);
    }
}
