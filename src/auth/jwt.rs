//! Session tokens handed to API clients after authorization.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::auth::oauth::UserInfo;
use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub exp: i64,
}

impl Claims {
    pub fn user(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.sub,
            "email": self.email,
            "name": self.name,
            "picture": self.picture,
        })
    }
}

/// HS256 signer and verifier.
pub struct JwtIssuer {
    secret: SecretString,
    ttl: Duration,
}

impl JwtIssuer {
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, user_id: &str, profile: &UserInfo) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            email: profile.email.clone(),
            name: profile.name.clone(),
            picture: profile.picture.clone(),
            exp: Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(secret: &str) -> JwtIssuer {
        JwtIssuer::new(SecretString::from(secret), Duration::from_secs(3600))
    }

    #[test]
    fn issued_token_verifies() {
        let profile = UserInfo {
            email: Some("a@example.com".to_string()),
            name: Some("Ada".to_string()),
            picture: None,
        };
        let jwt = issuer("s3cret");
        let token = jwt.issue("user-1", &profile).unwrap();
        let claims = jwt.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("a@example.com"));
        assert!(claims.exp > Utc::now().timestamp());
        assert_eq!(claims.user()["id"], "user-1");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issuer("one").issue("u", &UserInfo::default()).unwrap();
        assert!(matches!(
            issuer("two").verify(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let claims = Claims {
            sub: "u".to_string(),
            email: None,
            name: None,
            picture: None,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert!(issuer("k").verify(&token).is_err());
    }
}
