//! HTTP error responses: `{"detail": "..."}` with a status code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::error::{AuthError, Error, ScopeError};

pub const NOT_AUTHENTICATED: &str = "User not authenticated. Please complete OAuth flow first.";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::BadRequest(d) | Self::Unauthorized(d) | Self::NotFound(d) | Self::Internal(d) => d,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail() }));
        (self.status(), body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Scope(ScopeError::MissingSession { .. }) => {
                Self::Unauthorized(NOT_AUTHENTICATED.to_string())
            }
            Error::Scope(e) => Self::BadRequest(e.to_string()),
            Error::Auth(e) => e.into(),
            other => {
                error!("Request failed: {other}");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidState => Self::BadRequest("Invalid state parameter".to_string()),
            AuthError::MissingToken => {
                Self::Unauthorized("Authorization token required".to_string())
            }
            AuthError::InvalidToken(_) => Self::Unauthorized("Invalid or expired token".to_string()),
            AuthError::Exchange(e) | AuthError::UserInfo(e) => {
                error!("OAuth callback failed: {e}");
                Self::Internal(format!("OAuth callback error: {e}"))
            }
        }
    }
}

impl From<crate::error::DatabaseError> for ApiError {
    fn from(err: crate::error::DatabaseError) -> Self {
        Error::from(err).into()
    }
}
