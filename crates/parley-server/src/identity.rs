//! JWT identity resolution.

use crate::config::AuthConfig;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parley_core::{AuthError, IdentityResolver, UserIdentity};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEV_SECRET: &str = "dev-only-insecure-default-key-change-me";

/// Session token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Numeric user id.
    pub sub: String,
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}

/// Resolves HS256 session tokens.
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Build from configuration, falling back to a development secret.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        match &config.jwt_secret {
            Some(secret) => Self::new(secret.as_bytes()),
            None => {
                warn!("PARLEY_JWT_SECRET not set, using an insecure development secret");
                Self::new(DEV_SECRET.as_bytes())
            }
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })?;

        let id: i64 = claims.sub.parse().map_err(|_| AuthError::InvalidToken)?;
        Ok(UserIdentity::new(id, claims.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use parley_protocol::UserId;

    fn token(secret: &str, sub: &str, expires_in: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.into(),
            username: "alice".into(),
            exp: (now + expires_in).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolves_valid_token() {
        let resolver = JwtIdentityResolver::new(b"secret");
        let identity = resolver
            .resolve(&token("secret", "42", Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(identity.id, UserId(42));
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_rejects_bad_tokens() {
        let resolver = JwtIdentityResolver::new(b"secret");

        let wrong_key = token("other", "42", Duration::hours(1));
        let expired = token("secret", "42", Duration::hours(-2));
        let bad_sub = token("secret", "alice", Duration::hours(1));

        for token in [wrong_key.as_str(), expired.as_str(), bad_sub.as_str(), "garbage"] {
            assert_eq!(
                resolver.resolve(token).await.unwrap_err(),
                AuthError::InvalidToken
            );
        }
    }

    #[tokio::test]
    async fn test_missing_secret_uses_dev_key() {
        let resolver = JwtIdentityResolver::from_config(&AuthConfig { jwt_secret: None });
        let identity = resolver
            .resolve(&token(DEV_SECRET, "7", Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(identity.id, UserId(7));
    }
}
