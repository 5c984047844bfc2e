//! The `Job` record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Lifecycle state of a job. Transitions are enforced by the scheduler, never
/// by callers mutating a record directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobState {
    /// Terminal states are absorbing: once entered, a job never leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "timeout" => Ok(JobState::Timeout),
            other => Err(SchedError::Validation(format!(
                "unknown state filter: {other}"
            ))),
        }
    }

    /// Whether `self -> next` is a legal edge in the transition DAG:
    /// `pending -> {running, cancelled}`, `running -> {completed, failed, cancelled, timeout}`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }
}

/// A persisted unit of work: a shell command with attendant metadata and state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub job_id: String,
    pub job_name: Option<String>,
    pub command: String,
    pub working_dir: Option<String>,
    pub cpus: i64,
    pub memory: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub priority: i64,
    pub user: String,
    pub state: JobState,
    pub return_code: Option<i64>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub pid: Option<i64>,
    pub error_message: Option<String>,
}

/// Parameters accepted by `Scheduler::submit_job`, mirroring the CLI's `submit`
/// flags and the library's optional-field defaults.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub command: String,
    pub job_name: Option<String>,
    pub working_dir: Option<String>,
    pub cpus: Option<i64>,
    pub memory: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub priority: Option<i64>,
    pub output_path: Option<String>,
    pub error_path: Option<String>,
}

impl SubmitRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Validates `command` non-empty and `cpus >= 1`, consistent with §4.2.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(SchedError::Validation(
                "command must not be empty".to_string(),
            ));
        }
        if let Some(cpus) = self.cpus {
            if cpus < 1 {
                return Err(SchedError::Validation("cpus must be >= 1".to_string()));
            }
        }
        Ok(())
    }
}
