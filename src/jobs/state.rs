//! Job record state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokens::TokenUsage;

/// Status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the submission path, waiting in the queue.
    Pending,
    /// Claimed by a worker; subprocess work may be in flight.
    Running,
    /// Result and token usage are populated.
    Completed,
    /// Error text is populated.
    Failed,
}

impl JobStatus {
    /// Check if this status allows moving to `target`.
    ///
    /// `Running -> Running` is allowed so a redelivered task can resume a
    /// job whose previous worker died before writing a terminal state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A requested status change, applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Running,
    Completed {
        result: String,
        token_usage: TokenUsage,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error_message: String,
    },
}

impl JobUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Running => JobStatus::Running,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Statuses from which this update may be applied.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        match self {
            Self::Running => &[JobStatus::Pending, JobStatus::Running],
            Self::Completed { .. } | Self::Failed { .. } => &[JobStatus::Running],
        }
    }
}

/// Result of applying a [`JobUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The record was in a status the update may not leave from. Nothing
    /// was written.
    Skipped(JobStatus),
    NotFound,
}

/// Durable record of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "job_id")]
    pub id: Uuid,
    pub user_id: String,
    pub message: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Current time at the microsecond precision records are stored with.
fn stored_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl JobRecord {
    /// A fresh record in `pending`.
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        let now = stored_now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            message: message.into(),
            status: JobStatus::Pending,
            result: None,
            error_message: None,
            token_usage: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply an update in memory, with the same guard the store uses.
    pub fn apply(&mut self, update: &JobUpdate) -> TransitionOutcome {
        if !update.allowed_from().contains(&self.status) {
            return TransitionOutcome::Skipped(self.status);
        }
        let now = stored_now();
        match update {
            JobUpdate::Running => {}
            JobUpdate::Completed {
                result,
                token_usage,
                completed_at,
            } => {
                self.result = Some(result.clone());
                self.token_usage = Some(*token_usage);
                self.completed_at = Some(*completed_at);
            }
            JobUpdate::Failed { error_message } => {
                self.error_message = Some(error_message.clone());
                self.completed_at = Some(now);
            }
        }
        self.status = update.target();
        self.updated_at = now;
        TransitionOutcome::Applied
    }
}
