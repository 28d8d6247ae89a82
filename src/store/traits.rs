//! Unified `Database` trait: one async interface for sessions, job records,
//! and the task queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{JobRecord, JobStatus, JobUpdate, TransitionOutcome};
use crate::scopes::{CredentialBundle, ToolkitEnv};

/// A persisted OAuth session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    /// What the provider actually granted, as returned on the callback.
    pub granted_scopes: Vec<String>,
    /// Scope names the user asked for when starting authorization.
    pub selected_scopes: Vec<String>,
    pub authenticated: bool,
    /// Profile fields (email, name, picture).
    pub user_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn credential_bundle(&self) -> CredentialBundle {
        CredentialBundle {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            granted_scopes: self.granted_scopes.clone(),
        }
    }
}

/// A task reference on the durable queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: Uuid,
    pub queue: String,
    pub job_id: Uuid,
    pub user_id: String,
    pub message: String,
    pub env: ToolkitEnv,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
}

impl QueuedTask {
    pub fn new(
        queue: impl Into<String>,
        job_id: Uuid,
        user_id: impl Into<String>,
        message: impl Into<String>,
        env: ToolkitEnv,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            job_id,
            user_id: user_id.into(),
            message: message.into(),
            env,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert or replace the session for `session.user_id`.
    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), DatabaseError>;

    /// Full session row, authenticated or not.
    async fn get_session_record(
        &self,
        user_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Credentials of an authenticated session.
    async fn get_session(&self, user_id: &str) -> Result<Option<CredentialBundle>, DatabaseError> {
        Ok(self
            .get_session_record(user_id)
            .await?
            .filter(|s| s.authenticated)
            .map(|s| s.credential_bundle()))
    }

    /// Replace the remembered scope selection.
    async fn set_selected_scopes(
        &self,
        user_id: &str,
        scopes: &[String],
    ) -> Result<bool, DatabaseError>;

    /// Mark the session logged out. The row is kept.
    async fn deauthenticate(&self, user_id: &str) -> Result<bool, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record in `pending`.
    async fn create_job(&self, user_id: &str, message: &str) -> Result<JobRecord, DatabaseError>;

    /// Fetch a job owned by `user_id`. Another user's job reads as absent.
    async fn get_job(&self, job_id: Uuid, user_id: &str)
    -> Result<Option<JobRecord>, DatabaseError>;

    /// Fetch a job regardless of owner (worker side).
    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// A user's jobs, newest first.
    async fn list_jobs(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Apply a guarded status change as a single atomic row update.
    async fn update_job(
        &self,
        job_id: Uuid,
        update: &JobUpdate,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Delete job records created before `cutoff`. Returns the count.
    async fn delete_jobs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Task queue ──────────────────────────────────────────────────

    async fn enqueue_task(&self, task: &QueuedTask) -> Result<(), DatabaseError>;

    /// Atomically claim the oldest deliverable task on `queue`.
    ///
    /// A task is deliverable when unclaimed, or when its claim is older than
    /// `visibility_timeout` (the claiming worker is presumed dead).
    async fn claim_task(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedTask>, DatabaseError>;

    /// Remove a finished task from the queue.
    async fn ack_task(&self, task_id: Uuid) -> Result<(), DatabaseError>;

    /// Number of tasks waiting or in flight on `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<usize, DatabaseError>;

    /// Record short-lived result metadata for a finished task.
    async fn record_task_result(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Delete task result metadata that expired before `now`.
    async fn purge_expired_task_results(&self, now: DateTime<Utc>)
    -> Result<usize, DatabaseError>;
}
