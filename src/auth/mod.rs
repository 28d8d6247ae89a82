//! OAuth authorization flow and session tokens.

pub mod jwt;
pub mod oauth;
pub mod pending;

pub use jwt::{Claims, JwtIssuer};
pub use oauth::{GoogleOAuth, OAuthClient, TokenGrant, UserInfo};
pub use pending::{PendingAuth, PendingAuthStore};
