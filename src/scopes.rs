//! Scope resolution and the toolkit credential environment.
//!
//! A job only ever sees the intersection of what the user selected and what
//! the provider actually granted. The result is materialized as a typed
//! [`ToolkitEnv`] that is turned into environment variables exactly once,
//! at the process boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ScopeError;

/// Identity scopes requested alongside every authorization. Never forwarded
/// to the toolkit.
pub const IDENTITY_SCOPES: [&str; 3] = [
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

/// A named permission from the fixed catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Drive,
    GmailReadonly,
    GmailFull,
    GmailLabels,
    GmailCompose,
    CalendarEvents,
    CalendarReadonly,
    Documents,
    Spreadsheets,
    SpreadsheetsReadonly,
}

impl Scope {
    /// The full catalog, in presentation order.
    pub const ALL: [Scope; 10] = [
        Scope::Drive,
        Scope::GmailReadonly,
        Scope::GmailFull,
        Scope::GmailLabels,
        Scope::GmailCompose,
        Scope::CalendarEvents,
        Scope::CalendarReadonly,
        Scope::Documents,
        Scope::Spreadsheets,
        Scope::SpreadsheetsReadonly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Drive => "drive",
            Self::GmailReadonly => "gmail_readonly",
            Self::GmailFull => "gmail_full",
            Self::GmailLabels => "gmail_labels",
            Self::GmailCompose => "gmail_compose",
            Self::CalendarEvents => "calendar_events",
            Self::CalendarReadonly => "calendar_readonly",
            Self::Documents => "documents",
            Self::Spreadsheets => "spreadsheets",
            Self::SpreadsheetsReadonly => "spreadsheets_readonly",
        }
    }

    /// Canonical permission URI.
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Drive => "https://www.googleapis.com/auth/drive",
            Self::GmailReadonly => "https://www.googleapis.com/auth/gmail.readonly",
            Self::GmailFull => "https://www.googleapis.com/auth/gmail.modify",
            Self::GmailLabels => "https://www.googleapis.com/auth/gmail.labels",
            Self::GmailCompose => "https://www.googleapis.com/auth/gmail.compose",
            Self::CalendarEvents => "https://www.googleapis.com/auth/calendar.events",
            Self::CalendarReadonly => "https://www.googleapis.com/auth/calendar.readonly",
            Self::Documents => "https://www.googleapis.com/auth/documents",
            Self::Spreadsheets => "https://www.googleapis.com/auth/spreadsheets",
            Self::SpreadsheetsReadonly => "https://www.googleapis.com/auth/spreadsheets.readonly",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Drive => "Full access to Google Drive files and folders",
            Self::GmailReadonly => "Read-only access to Gmail",
            Self::GmailFull => "Full access to Gmail (read, send, modify)",
            Self::GmailLabels => "Manage Gmail labels",
            Self::GmailCompose => "Compose Gmail messages",
            Self::CalendarEvents => "Manage calendar events",
            Self::CalendarReadonly => "Read-only access to calendar",
            Self::Documents => "Access Google Docs",
            Self::Spreadsheets => "Access Google Sheets",
            Self::SpreadsheetsReadonly => "Read-only access to Google Sheets",
        }
    }

    /// Look up a scope by its canonical URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.uri() == uri)
    }

    /// Recognise a granted-scope entry, which may be stored as either a
    /// catalog name or a URI.
    fn from_grant(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        Self::from_uri(entry).or_else(|| entry.parse().ok())
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.name() == s)
            .ok_or_else(|| ScopeError::UnknownScope(s.to_string()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, duplicate-free set of scopes a user asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSelection(Vec<Scope>);

impl ScopeSelection {
    /// Parse scope names. Any name outside the catalog rejects the whole
    /// selection.
    pub fn parse<I, S>(names: I) -> Result<Self, ScopeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scopes = Vec::new();
        for name in names {
            let scope: Scope = name.as_ref().trim().parse()?;
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        Ok(Self(scopes))
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.0
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|s| s.name().to_string()).collect()
    }

    /// URIs to request at authorization time: identity scopes first, then
    /// the selection.
    pub fn authorization_uris(&self) -> Vec<String> {
        IDENTITY_SCOPES
            .iter()
            .map(|s| s.to_string())
            .chain(self.0.iter().map(|s| s.uri().to_string()))
            .collect()
    }

    /// Intersection with the granted set, in selection order.
    ///
    /// Granted entries that are not catalog scopes are ignored. An empty
    /// intersection yields an empty result.
    pub fn resolve(&self, granted: &[String]) -> Vec<Scope> {
        let granted: Vec<Scope> = granted.iter().filter_map(|g| Scope::from_grant(g)).collect();
        self.0
            .iter()
            .copied()
            .filter(|scope| granted.contains(scope))
            .collect()
    }
}

/// One user's authorization as handed over by the session store.
/// Read-only for the lifetime of a job.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scope identifiers, as names or URIs.
    pub granted_scopes: Vec<String>,
}

/// Application-level OAuth client credentials forwarded to the toolkit.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Typed environment for one toolkit process.
///
/// Built by the submission path, carried on the queued task as JSON, and
/// converted to variables once by [`to_env_map`](Self::to_env_map).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolkitEnv {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry in Unix milliseconds.
    pub token_expires_at_ms: Option<i64>,
    pub client_id: String,
    pub client_secret: String,
    /// Canonical URIs of the authorized scopes.
    pub authorized_scopes: Vec<String>,
    pub session_user_id: String,
}

impl ToolkitEnv {
    /// Resolve a selection against a credential bundle.
    pub fn resolve(
        user_id: &str,
        selection: &ScopeSelection,
        bundle: &CredentialBundle,
        client: &ClientCredentials,
    ) -> Self {
        let authorized = selection.resolve(&bundle.granted_scopes);
        Self {
            access_token: bundle.access_token.expose_secret().to_string(),
            refresh_token: bundle
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string())
                .unwrap_or_default(),
            token_expires_at_ms: bundle.expires_at.map(|t| t.timestamp_millis()),
            client_id: client.client_id.clone(),
            client_secret: client.client_secret.expose_secret().to_string(),
            authorized_scopes: authorized.iter().map(|s| s.uri().to_string()).collect(),
            session_user_id: user_id.to_string(),
        }
    }

    /// Variable map handed to the child process.
    pub fn to_env_map(&self) -> BTreeMap<String, String> {
        let scopes = serde_json::Value::from(self.authorized_scopes.clone()).to_string();
        BTreeMap::from([
            ("GOOGLE_ACCESS_TOKEN".to_string(), self.access_token.clone()),
            ("GOOGLE_REFRESH_TOKEN".to_string(), self.refresh_token.clone()),
            (
                "GOOGLE_TOKEN_EXPIRES_AT".to_string(),
                self.token_expires_at_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_default(),
            ),
            ("GOOGLE_CLIENT_ID".to_string(), self.client_id.clone()),
            ("GOOGLE_CLIENT_SECRET".to_string(), self.client_secret.clone()),
            ("GOOGLE_AUTHORIZED_SCOPES".to_string(), scopes),
            ("SESSION_USER_ID".to_string(), self.session_user_id.clone()),
        ])
    }
}

impl fmt::Debug for ToolkitEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolkitEnv")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_expires_at_ms", &self.token_expires_at_ms)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authorized_scopes", &self.authorized_scopes)
            .field("session_user_id", &self.session_user_id)
            .finish()
    }
}
