//! Submission path: validate scopes, resolve credentials, create the job
//! record, enqueue the task.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, QueueError, ScopeError};
use crate::jobs::JobRecord;
use crate::scopes::{ClientCredentials, ScopeSelection, ToolkitEnv};
use crate::store::{Database, QueuedTask};

/// Turns a user request into a `pending` job plus a queued task.
pub struct JobSubmitter {
    db: Arc<dyn Database>,
    client: ClientCredentials,
    queue_name: String,
}

impl JobSubmitter {
    pub fn new(db: Arc<dyn Database>, client: ClientCredentials, queue_name: impl Into<String>) -> Self {
        Self {
            db,
            client,
            queue_name: queue_name.into(),
        }
    }

    /// Submit `message` for `user_id`.
    ///
    /// `scopes` overrides the selection remembered on the session. Unknown
    /// scope names and missing sessions are rejected before any record is
    /// written.
    pub async fn submit(
        &self,
        user_id: &str,
        message: &str,
        scopes: Option<&[String]>,
    ) -> Result<JobRecord, Error> {
        let session = self
            .db
            .get_session_record(user_id)
            .await?
            .filter(|s| s.authenticated)
            .ok_or_else(|| ScopeError::MissingSession {
                user_id: user_id.to_string(),
            })?;

        let selection = match scopes {
            Some(names) => ScopeSelection::parse(names)?,
            None => ScopeSelection::parse(&session.selected_scopes)?,
        };

        let env = ToolkitEnv::resolve(user_id, &selection, &session.credential_bundle(), &self.client);
        let job = self.db.create_job(user_id, message).await?;

        let task = QueuedTask::new(&self.queue_name, job.id, user_id, message, env);
        self.db
            .enqueue_task(&task)
            .await
            .map_err(|e| QueueError::Enqueue {
                job_id: job.id,
                reason: e.to_string(),
            })?;

        info!(
            job_id = %job.id,
            task_id = %task.id,
            queue = %self.queue_name,
            authorized_scopes = task.env.authorized_scopes.len(),
            "Job queued"
        );
        Ok(job)
    }
}
