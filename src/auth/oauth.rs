//! Google OAuth 2.0 authorization-code client.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::OAuthConfig;
use crate::error::AuthError;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Tokens returned by a successful code exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scope identifiers. Empty when the provider omitted them.
    pub granted_scopes: Vec<String>,
}

/// Profile fields from the userinfo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// The authorization-code flow as seen by the HTTP layer.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Consent URL for `scopes`, carrying `state` back to the callback.
    fn authorization_url(&self, scopes: &[String], state: &str) -> Result<String, AuthError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError>;

    async fn fetch_userinfo(&self, access_token: &SecretString) -> Result<UserInfo, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<GrantedScope>,
}

/// Granted scope arrives as a space-separated string or as a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GrantedScope {
    Text(String),
    List(Vec<String>),
}

impl GrantedScope {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Text(s) => s.split_whitespace().map(str::to_string).collect(),
            Self::List(v) => v,
        }
    }
}

impl TokenResponse {
    fn into_grant(self, now: DateTime<Utc>) -> TokenGrant {
        TokenGrant {
            access_token: SecretString::from(self.access_token),
            refresh_token: self.refresh_token.map(SecretString::from),
            expires_at: self.expires_in.map(|secs| now + ChronoDuration::seconds(secs)),
            granted_scopes: self.scope.map(GrantedScope::into_vec).unwrap_or_default(),
        }
    }
}

/// Google endpoints over `reqwest`.
pub struct GoogleOAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    redirect_url: String,
}

impl GoogleOAuth {
    pub fn new(config: &OAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
        }
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuth {
    fn authorization_url(&self, scopes: &[String], state: &str) -> Result<String, AuthError> {
        let scope = scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            AUTH_ENDPOINT,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::Exchange(format!("invalid authorization URL: {e}")))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange(format!("HTTP {status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Exchange(format!("malformed token response: {e}")))?;
        Ok(token.into_grant(Utc::now()))
    }

    async fn fetch_userinfo(&self, access_token: &SecretString) -> Result<UserInfo, AuthError> {
        let response = self
            .http
            .get(USERINFO_ENDPOINT)
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(|e| AuthError::UserInfo(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::UserInfo(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::UserInfo(e.to_string()))
    }
}
