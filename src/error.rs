//! Error types for mcp-jobs.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Validation failures raised before a job exists. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    #[error("No authenticated session for user {user_id}")]
    MissingSession { user_id: String },
}

/// Failures of a single agent execution.
///
/// Every variant renders as `Agent error: <cause>`, which is the text
/// persisted on a failed job record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Agent error: failed to start toolkit: {0}")]
    Start(String),

    #[error("Agent error: protocol failure: {0}")]
    Protocol(String),

    #[error("Agent error: {0}")]
    Execution(String),

    #[error("Agent error: task exceeded soft time limit of {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Queue and worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to enqueue job {job_id}: {reason}")]
    Enqueue { job_id: Uuid, reason: String },

    #[error("Failed to spawn worker {slot}: {reason}")]
    WorkerSpawn { slot: usize, reason: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// OAuth and session token errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid or expired authorization state")]
    InvalidState,

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("User info request failed: {0}")]
    UserInfo(String),

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
