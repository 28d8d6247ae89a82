//! HTTP surface: authorization, job submission, and result polling.
//!
//! Handlers only touch the async store and the queue; all agent work
//! happens in the worker pool.

pub mod auth;
pub mod error;
pub mod jobs;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::auth::{JwtIssuer, OAuthClient, PendingAuthStore};
use crate::config::Config;
use crate::jobs::JobSubmitter;
use crate::queue::supervisor::shutdown_signal;
use crate::scopes::ClientCredentials;
use crate::store::Database;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub submitter: Arc<JobSubmitter>,
    pub pending: Arc<PendingAuthStore>,
    pub oauth: Arc<dyn OAuthClient>,
    pub jwt: Arc<JwtIssuer>,
}

impl AppState {
    pub fn new(db: Arc<dyn Database>, oauth: Arc<dyn OAuthClient>, config: &Config) -> Self {
        let client = ClientCredentials {
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
        };
        Self {
            submitter: Arc::new(JobSubmitter::new(
                db.clone(),
                client,
                config.queue.queue_name.clone(),
            )),
            pending: Arc::new(PendingAuthStore::new(config.oauth.state_ttl)),
            jwt: Arc::new(JwtIssuer::new(
                config.oauth.jwt_secret.clone(),
                config.oauth.jwt_ttl,
            )),
            db,
            oauth,
        }
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "MCP jobs API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "auth": "/auth/scopes",
            "run": "/run",
            "result": "/result/{job_id}",
            "status": "/auth/status",
            "login": "/auth/login",
        },
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/scopes", get(auth::list_scopes).post(auth::select_scopes))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/status", get(auth::status))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", delete(auth::logout))
        .route("/me", get(auth::me))
        .route("/run", post(jobs::run))
        .route("/result/{job_id}", get(jobs::result))
        .route("/jobs", get(jobs::list))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve until Ctrl-C or SIGTERM.
pub async fn serve(host: &str, port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}
