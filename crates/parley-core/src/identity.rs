//! Identity resolution for bearer tokens.

use crate::connection::UserIdentity;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("Token not provided")]
    MissingToken,

    /// The token is malformed, expired, or unknown.
    #[error("Invalid token")]
    InvalidToken,

    /// The connection already authenticated as a different user.
    #[error("Connection already authenticated as another user")]
    AlreadyAuthenticated,

    /// The connection closed before authentication completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The resolver backend could not be reached.
    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
}

/// Resolves bearer tokens to user identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve an already-normalized token.
    async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Strip transport framing from a raw token: a leading `Bearer ` scheme,
/// surrounding quotes, and whitespace.
///
/// Returns `None` if nothing is left.
#[must_use]
pub fn normalize_token(raw: &str) -> Option<String> {
    let unquote = |s: &str| -> String {
        s.trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string()
    };

    let mut token = unquote(raw);
    if let Some(rest) = strip_scheme(&token) {
        token = unquote(rest);
    }

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn strip_scheme(token: &str) -> Option<&str> {
    let scheme = token.get(..6)?;
    let rest = token.get(6..)?;
    if scheme.eq_ignore_ascii_case("bearer") && (rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        Some(rest)
    } else {
        None
    }
}

/// Identity resolver backed by an in-memory token table.
#[derive(Debug, Default)]
pub struct MemoryIdentityResolver {
    tokens: DashMap<String, UserIdentity>,
}

impl MemoryIdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    pub fn insert(&self, token: impl Into<String>, identity: UserIdentity) {
        self.tokens.insert(token.into(), identity);
    }

    /// Revoke a token.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}

#[async_trait]
impl IdentityResolver for MemoryIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.tokens
            .get(token)
            .map(|identity| identity.clone())
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("abc").as_deref(), Some("abc"));
        assert_eq!(normalize_token("Bearer abc").as_deref(), Some("abc"));
        assert_eq!(normalize_token("bearer  abc ").as_deref(), Some("abc"));
        assert_eq!(normalize_token("\"Bearer abc\"").as_deref(), Some("abc"));
        assert_eq!(normalize_token("Bearer 'abc'").as_deref(), Some("abc"));
        assert_eq!(normalize_token("  ").as_deref(), None);
        assert_eq!(normalize_token("Bearer ").as_deref(), None);
        assert_eq!(normalize_token("\"\"").as_deref(), None);
    }

    #[tokio::test]
    async fn test_memory_resolver() {
        let resolver = MemoryIdentityResolver::new();
        resolver.insert("t1", UserIdentity::new(1, "alice"));

        assert_eq!(resolver.resolve("t1").await.unwrap().username, "alice");
        assert_eq!(
            resolver.resolve("t2").await.unwrap_err(),
            AuthError::InvalidToken
        );

        assert!(resolver.revoke("t1"));
        assert!(resolver.resolve("t1").await.is_err());
    }
}
