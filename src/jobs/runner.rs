//! Worker-side execution of one queued task.
//!
//! Split into three steps so the worker can run the bridge on its own
//! runtime while store I/O stays on the control runtime:
//! [`begin`](JobRunner::begin), [`run_bridge`], [`finish`](JobRunner::finish).
//! [`execute`](JobRunner::execute) composes them on one runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentReply;
use crate::bridge::{BridgeRun, Teardown, ToolkitBridge, TurnHandler};
use crate::error::{AgentError, DatabaseError};
use crate::jobs::{JobStatus, JobUpdate, TransitionOutcome};
use crate::store::{Database, QueuedTask};

/// Decision taken when a task is picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// The record is now `running`; execute the task.
    Proceed,
    /// Nothing to do. The task is acknowledged.
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A previous delivery already finished the job.
    AlreadyTerminal(JobStatus),
    /// The record no longer exists (swept).
    Missing,
}

/// Summary of one processed task.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: Uuid,
    /// Status of the record after processing.
    pub status: Option<JobStatus>,
    pub skipped: Option<SkipReason>,
    /// Cleanup record of the toolkit, when it ran.
    pub teardown: Option<Teardown>,
}

/// Drives job records through their transitions around a bridge run.
pub struct JobRunner {
    db: Arc<dyn Database>,
    result_expires: Duration,
}

impl JobRunner {
    pub fn new(db: Arc<dyn Database>, result_expires: Duration) -> Self {
        Self { db, result_expires }
    }

    /// Mark the job `running`. Terminal or missing records are acknowledged
    /// and skipped, never overwritten.
    pub async fn begin(&self, task: &QueuedTask) -> Result<Begin, DatabaseError> {
        if task.attempts > 1 {
            info!(job_id = %task.job_id, attempts = task.attempts, "Task redelivered");
        }
        let reason = match self.db.update_job(task.job_id, &JobUpdate::Running).await? {
            TransitionOutcome::Applied => {
                debug!(job_id = %task.job_id, "Job running");
                return Ok(Begin::Proceed);
            }
            TransitionOutcome::Skipped(status) => SkipReason::AlreadyTerminal(status),
            TransitionOutcome::NotFound => SkipReason::Missing,
        };
        info!(job_id = %task.job_id, ?reason, "Skipping task");
        self.db.ack_task(task.id).await?;
        Ok(Begin::Skip(reason))
    }

    /// Write the terminal state, record result metadata, and acknowledge.
    pub async fn finish(
        &self,
        task: &QueuedTask,
        outcome: &Result<AgentReply, AgentError>,
    ) -> Result<JobStatus, DatabaseError> {
        let update = match outcome {
            Ok(reply) => JobUpdate::Completed {
                result: reply.response.clone(),
                token_usage: reply.token_usage,
                completed_at: reply.completed_at,
            },
            Err(e) => JobUpdate::Failed {
                error_message: e.to_string(),
            },
        };

        let status = match self.db.update_job(task.job_id, &update).await? {
            TransitionOutcome::Applied => update.target(),
            TransitionOutcome::Skipped(current) => {
                warn!(job_id = %task.job_id, %current, "Job already left running, result dropped");
                current
            }
            TransitionOutcome::NotFound => {
                warn!(job_id = %task.job_id, "Job record vanished before completion");
                update.target()
            }
        };

        match outcome {
            Ok(reply) => info!(
                job_id = %task.job_id,
                total_tokens = reply.token_usage.total_tokens(),
                "Job completed"
            ),
            Err(e) => warn!(job_id = %task.job_id, error = %e, "Job failed"),
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.result_expires).unwrap_or(chrono::Duration::hours(1));
        if let Err(e) = self
            .db
            .record_task_result(task.id, task.job_id, status, expires_at)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to record task result");
        }

        self.db.ack_task(task.id).await?;
        Ok(status)
    }

    /// Process `task` end to end on the current runtime.
    pub async fn execute(
        &self,
        task: &QueuedTask,
        bridge: &ToolkitBridge,
        handler: &dyn TurnHandler,
        soft_limit: Duration,
    ) -> Result<ExecutionReport, DatabaseError> {
        if let Begin::Skip(reason) = self.begin(task).await? {
            return Ok(ExecutionReport {
                job_id: task.job_id,
                status: match reason {
                    SkipReason::AlreadyTerminal(s) => Some(s),
                    SkipReason::Missing => None,
                },
                skipped: Some(reason),
                teardown: None,
            });
        }

        let run = run_bridge(bridge, task, handler, soft_limit).await;
        let status = self.finish(task, &run.outcome).await?;
        Ok(ExecutionReport {
            job_id: task.job_id,
            status: Some(status),
            skipped: None,
            teardown: Some(run.teardown),
        })
    }
}

/// Run the bridge for `task` under the soft time limit.
///
/// When the limit fires the bridge is cancelled, cleans up, and the outcome
/// becomes [`AgentError::Timeout`] carrying the configured limit.
pub async fn run_bridge(
    bridge: &ToolkitBridge,
    task: &QueuedTask,
    handler: &dyn TurnHandler,
    soft_limit: Duration,
) -> BridgeRun {
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(soft_limit).await;
            cancel.cancel();
        })
    };

    let mut run = bridge.run(&task.env, &task.message, handler, &cancel).await;
    timer.abort();

    if cancel.is_cancelled() && matches!(run.outcome, Err(AgentError::Timeout(_))) {
        run.outcome = Err(AgentError::Timeout(soft_limit));
    }
    run
}
