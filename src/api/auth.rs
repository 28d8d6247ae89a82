//! Authorization endpoints and the bearer-token extractor.

use axum::Json;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use super::error::ApiError;
use crate::auth::{Claims, UserInfo};
use crate::error::AuthError;
use crate::scopes::{Scope, ScopeSelection};
use crate::store::SessionRecord;

const USERINFO_EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

/// Verified claims of the caller's bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn user_id(&self) -> &str {
        &self.0.sub
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        Ok(Self(state.jwt.verify(token)?))
    }
}

/// GET /auth/scopes
pub async fn list_scopes() -> Json<Value> {
    let scopes: Vec<Value> = Scope::ALL
        .iter()
        .map(|s| json!({ "name": s.name(), "uri": s.uri(), "description": s.description() }))
        .collect();
    Json(json!({
        "scopes": scopes,
        "description": "Select the scopes you want to authorize for Google services",
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScopeRequest {
    pub scopes: Vec<String>,
}

/// POST /auth/scopes
///
/// Starts an authorization for a freshly minted user id.
pub async fn select_scopes(
    State(state): State<AppState>,
    Json(body): Json<ScopeRequest>,
) -> Result<Json<Value>, ApiError> {
    let invalid: Vec<&String> = body
        .scopes
        .iter()
        .filter(|name| name.trim().parse::<Scope>().is_err())
        .collect();
    if !invalid.is_empty() {
        return Err(ApiError::BadRequest(format!("Invalid scopes: {invalid:?}")));
    }
    let selection = ScopeSelection::parse(&body.scopes).map_err(crate::error::Error::from)?;

    let user_id = Uuid::new_v4().to_string();
    let pending_state = state.pending.insert(&user_id, selection.clone()).await;
    let auth_url = state
        .oauth
        .authorization_url(&selection.authorization_uris(), &pending_state)?;

    info!(user_id = %user_id, scopes = ?selection.names(), "Authorization started");
    Ok(Json(json!({
        "auth_url": auth_url,
        "user_id": user_id,
        "state": pending_state,
        "message": "Visit the auth_url to authorize the application",
    })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /auth/callback
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, ApiError> {
    if let Some(error) = params.error {
        return Err(ApiError::BadRequest(format!("OAuth error: {error}")));
    }
    let (Some(code), Some(flow_state)) = (params.code, params.state) else {
        return Err(ApiError::BadRequest(
            "Missing authorization code or state".to_string(),
        ));
    };
    let pending = state
        .pending
        .take(&flow_state)
        .await
        .ok_or(AuthError::InvalidState)?;

    let grant = state.oauth.exchange_code(&code).await?;

    let profile = if grant.granted_scopes.iter().any(|s| s == USERINFO_EMAIL_SCOPE) {
        match state.oauth.fetch_userinfo(&grant.access_token).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user_id = %pending.user_id, "Could not fetch user info: {e}");
                UserInfo::default()
            }
        }
    } else {
        UserInfo::default()
    };

    let requested = pending.selection.names();
    let all_requested_granted = pending
        .selection
        .scopes()
        .iter()
        .all(|s| grant.granted_scopes.iter().any(|g| g == s.uri()));
    if !all_requested_granted {
        warn!(user_id = %pending.user_id, "Some requested scopes were not granted");
    }

    let token = state.jwt.issue(&pending.user_id, &profile)?;
    let claims = state.jwt.verify(&token)?;

    let now = Utc::now();
    state
        .db
        .upsert_session(&SessionRecord {
            user_id: pending.user_id.clone(),
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at: grant.expires_at,
            granted_scopes: grant.granted_scopes.clone(),
            selected_scopes: requested.clone(),
            authenticated: true,
            user_data: claims.user(),
            created_at: now,
            updated_at: now,
        })
        .await?;

    info!(
        user_id = %pending.user_id,
        granted = grant.granted_scopes.len(),
        "Authorization completed"
    );
    Ok(Json(json!({
        "token": token,
        "user_id": pending.user_id,
        "user": claims.user(),
        "requested_scopes": requested,
        "granted_scopes": grant.granted_scopes,
        "all_requested_granted": all_requested_granted,
    })))
}

/// GET /auth/status
pub async fn status(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>, ApiError> {
    let body = match state.db.get_session_record(user.user_id()).await? {
        Some(session) => json!({
            "authenticated": session.authenticated,
            "requested_scopes": session.selected_scopes,
            "total_granted_scopes": session.granted_scopes.len(),
            "granted_scopes": session.granted_scopes,
            "email": user.0.email,
        }),
        None => json!({
            "authenticated": false,
            "requested_scopes": [],
            "granted_scopes": [],
            "email": user.0.email,
            "total_granted_scopes": 0,
        }),
    };
    Ok(Json(body))
}

/// POST /auth/login
///
/// Re-issues the session token for a caller whose session still exists.
pub async fn login(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>, ApiError> {
    if state.db.get_session_record(user.user_id()).await?.is_none() {
        return Err(ApiError::Unauthorized("User session not found".to_string()));
    }
    let profile = UserInfo {
        email: user.0.email.clone(),
        name: user.0.name.clone(),
        picture: user.0.picture.clone(),
    };
    let token = state.jwt.issue(user.user_id(), &profile)?;
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "user": user.0.user(),
        "expires_in": state.jwt.ttl().as_secs(),
    })))
}

/// DELETE /auth/logout
pub async fn logout(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>, ApiError> {
    state.db.deauthenticate(user.user_id()).await?;
    info!(user_id = %user.user_id(), "User logged out");
    Ok(Json(json!({ "message": "User logged out successfully" })))
}

/// GET /me
pub async fn me(user: AuthUser) -> Json<Value> {
    Json(json!({
        "user": user.0.user(),
        "message": "Current user information",
    }))
}
