//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Worker processes and the API
//! server each open their own connection to the same file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{JobRecord, JobStatus, JobUpdate, TransitionOutcome};
use crate::scopes::ToolkitEnv;
use crate::store::migrations;
use crate::store::traits::{Database, QueuedTask, SessionRecord};

/// How long a connection waits on a locked database file.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Several worker processes share the file.
        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        debug!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    // PRAGMAs may return a row, so go through query() rather than execute().
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

/// Canonical timestamp format. Fixed width, so text order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// `status IN (...)` clause for a guard. Values come from a closed enum.
fn status_guard(allowed: &[JobStatus]) -> String {
    let list: Vec<String> = allowed.iter().map(|s| format!("'{}'", s.as_str())).collect();
    format!("status IN ({})", list.join(", "))
}

/// Map a libsql Row to a JobRecord.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let usage_str: Option<String> = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(7).map_err(get_err)?;
    let updated_str: String = row.get(8).map_err(get_err)?;
    let completed_str: Option<String> = row.get(9).map_err(get_err)?;

    let token_usage = match usage_str {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
            DatabaseError::Serialization(format!("token_usage for job {id_str}: {e}"))
        })?),
        None => None,
    };

    Ok(JobRecord {
        id: parse_uuid(&id_str)?,
        user_id: row.get(1).map_err(get_err)?,
        message: row.get(2).map_err(get_err)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        result: row.get(4).map_err(get_err)?,
        error_message: row.get(5).map_err(get_err)?,
        token_usage,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(completed_str),
    })
}

/// Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<SessionRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));

    let access: String = row.get(1).map_err(get_err)?;
    let refresh: Option<String> = row.get(2).map_err(get_err)?;
    let expires: Option<String> = row.get(3).map_err(get_err)?;
    let granted: String = row.get(4).map_err(get_err)?;
    let selected: String = row.get(5).map_err(get_err)?;
    let authenticated: i64 = row.get(6).map_err(get_err)?;
    let user_data: String = row.get(7).map_err(get_err)?;
    let created_str: String = row.get(8).map_err(get_err)?;
    let updated_str: String = row.get(9).map_err(get_err)?;

    Ok(SessionRecord {
        user_id: row.get(0).map_err(get_err)?,
        access_token: SecretString::from(access),
        refresh_token: refresh.map(SecretString::from),
        expires_at: parse_optional_datetime(expires),
        granted_scopes: json_list(&granted),
        selected_scopes: json_list(&selected),
        authenticated: authenticated != 0,
        user_data: serde_json::from_str(&user_data).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<QueuedTask, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let job_str: String = row.get(2).map_err(get_err)?;
    let env_str: String = row.get(5).map_err(get_err)?;
    let enqueued_str: String = row.get(6).map_err(get_err)?;
    let attempts: i64 = row.get(7).map_err(get_err)?;

    let env: ToolkitEnv = serde_json::from_str(&env_str)
        .map_err(|e| DatabaseError::Serialization(format!("env for task {id_str}: {e}")))?;

    Ok(QueuedTask {
        id: parse_uuid(&id_str)?,
        queue: row.get(1).map_err(get_err)?,
        job_id: parse_uuid(&job_str)?,
        user_id: row.get(3).map_err(get_err)?,
        message: row.get(4).map_err(get_err)?,
        env,
        enqueued_at: parse_datetime(&enqueued_str),
        attempts: attempts.max(0) as u32,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, user_id, message, status, result, error_message, token_usage, created_at, updated_at, completed_at";

const SESSION_COLUMNS: &str = "user_id, access_token, refresh_token, expires_at, granted_scopes, selected_scopes, authenticated, user_data, created_at, updated_at";

const TASK_COLUMNS: &str = "id, queue, job_id, user_id, message, env, enqueued_at, attempts";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), DatabaseError> {
        let granted = serde_json::to_string(&session.granted_scopes)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let selected = serde_json::to_string(&session.selected_scopes)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO user_sessions (user_id, access_token, refresh_token, expires_at, granted_scopes, selected_scopes, authenticated, user_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, user_sessions.refresh_token),
                    expires_at = excluded.expires_at,
                    granted_scopes = excluded.granted_scopes,
                    selected_scopes = excluded.selected_scopes,
                    authenticated = excluded.authenticated,
                    user_data = excluded.user_data,
                    updated_at = excluded.updated_at",
                params![
                    session.user_id.clone(),
                    session.access_token.expose_secret().to_string(),
                    opt_text_owned(
                        session
                            .refresh_token
                            .as_ref()
                            .map(|t| t.expose_secret().to_string())
                    ),
                    opt_text_owned(session.expires_at.as_ref().map(fmt_ts)),
                    granted,
                    selected,
                    session.authenticated as i64,
                    session.user_data.to_string(),
                    fmt_ts(&session.created_at),
                    fmt_ts(&session.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session: {e}")))?;

        debug!(user_id = %session.user_id, "Session upserted");
        Ok(())
    }

    async fn get_session_record(
        &self,
        user_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session_record: {e}"))),
        }
    }

    async fn set_selected_scopes(
        &self,
        user_id: &str,
        scopes: &[String],
    ) -> Result<bool, DatabaseError> {
        let selected = serde_json::to_string(scopes)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let count = self
            .conn()
            .execute(
                "UPDATE user_sessions SET selected_scopes = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![selected, fmt_ts(&Utc::now()), user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_selected_scopes: {e}")))?;
        Ok(count > 0)
    }

    async fn deauthenticate(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE user_sessions SET authenticated = 0, updated_at = ?1 WHERE user_id = ?2",
                params![fmt_ts(&Utc::now()), user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deauthenticate: {e}")))?;
        Ok(count > 0)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, user_id: &str, message: &str) -> Result<JobRecord, DatabaseError> {
        let job = JobRecord::new(user_id, message);
        self.conn()
            .execute(
                "INSERT INTO job_records (id, user_id, message, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job.id.to_string(),
                    job.user_id.clone(),
                    job.message.clone(),
                    job.status.as_str(),
                    fmt_ts(&job.created_at),
                    fmt_ts(&job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.id, user_id, "Job record created");
        Ok(job)
    }

    async fn get_job(
        &self,
        job_id: Uuid,
        user_id: &str,
    ) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM job_records WHERE id = ?1 AND user_id = ?2"),
                params![job_id.to_string(), user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM job_records WHERE id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job_by_id: {e}"))),
        }
    }

    async fn list_jobs(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job_records WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ),
                params![user_id, limit as i64, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        update: &JobUpdate,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn();
        let now = fmt_ts(&Utc::now());
        let guard = status_guard(update.allowed_from());
        let target = update.target().as_str();

        let affected = match update {
            JobUpdate::Running => conn
                .execute(
                    &format!(
                        "UPDATE job_records SET status = ?1, updated_at = ?2 WHERE id = ?3 AND {guard}"
                    ),
                    params![target, now, job_id.to_string()],
                )
                .await,
            JobUpdate::Completed {
                result,
                token_usage,
                completed_at,
            } => {
                let usage = serde_json::to_string(token_usage)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                conn.execute(
                    &format!(
                        "UPDATE job_records SET status = ?1, result = ?2, token_usage = ?3, completed_at = ?4, updated_at = ?5 WHERE id = ?6 AND {guard}"
                    ),
                    params![
                        target,
                        result.clone(),
                        usage,
                        fmt_ts(completed_at),
                        now,
                        job_id.to_string()
                    ],
                )
                .await
            }
            JobUpdate::Failed { error_message } => conn
                .execute(
                    &format!(
                        "UPDATE job_records SET status = ?1, error_message = ?2, completed_at = ?3, updated_at = ?3 WHERE id = ?4 AND {guard}"
                    ),
                    params![target, error_message.clone(), now, job_id.to_string()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if affected > 0 {
            debug!(job_id = %job_id, status = target, "Job status updated");
            return Ok(TransitionOutcome::Applied);
        }

        Ok(match self.get_job_by_id(job_id).await? {
            Some(job) => TransitionOutcome::Skipped(job.status),
            None => TransitionOutcome::NotFound,
        })
    }

    async fn delete_jobs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM job_records WHERE created_at < ?1",
                params![fmt_ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_jobs_created_before: {e}")))?;

        if count > 0 {
            info!(count, "Deleted old job records");
        }
        Ok(count as usize)
    }

    // ── Task queue ──────────────────────────────────────────────────

    async fn enqueue_task(&self, task: &QueuedTask) -> Result<(), DatabaseError> {
        let env = serde_json::to_string(&task.env)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO task_queue (id, queue, job_id, user_id, message, env, enqueued_at, attempts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id.to_string(),
                    task.queue.clone(),
                    task.job_id.to_string(),
                    task.user_id.clone(),
                    task.message.clone(),
                    env,
                    fmt_ts(&task.enqueued_at),
                    task.attempts as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_task: {e}")))?;

        debug!(task_id = %task.id, job_id = %task.job_id, queue = %task.queue, "Task enqueued");
        Ok(())
    }

    async fn claim_task(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedTask>, DatabaseError> {
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE task_queue SET claimed_at = ?1, claimed_by = ?2, attempts = attempts + 1
                     WHERE id = (
                        SELECT id FROM task_queue
                        WHERE queue = ?3 AND (claimed_at IS NULL OR claimed_at < ?4)
                        ORDER BY enqueued_at ASC
                        LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![fmt_ts(&now), worker_id, queue, fmt_ts(&stale_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)?;
                debug!(task_id = %task.id, job_id = %task.job_id, attempts = task.attempts, worker_id, "Task claimed");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_task: {e}"))),
        }
    }

    async fn ack_task(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM task_queue WHERE id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ack_task: {e}")))?;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM task_queue WHERE queue = ?1",
                params![queue],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_depth: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("queue_depth: {e}")))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("queue_depth: {e}"))),
        }
    }

    async fn record_task_result(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO task_results (task_id, job_id, status, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    task_id.to_string(),
                    job_id.to_string(),
                    status.as_str(),
                    fmt_ts(&expires_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_task_result: {e}")))?;
        Ok(())
    }

    async fn purge_expired_task_results(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM task_results WHERE expires_at < ?1",
                params![fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_task_results: {e}")))?;
        Ok(count as usize)
    }
}
