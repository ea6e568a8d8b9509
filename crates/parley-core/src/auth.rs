//! Auth gate.
//!
//! Connections open unauthenticated and must send an `auth` event before
//! anything else is routed for them. The gate resolves the token, binds the
//! connection to the resulting identity (superseding any older session of
//! the same user) and announces the user as online.

use crate::connection::{ConnectionId, UserIdentity};
use crate::identity::{normalize_token, AuthError, IdentityResolver};
use crate::presence::PresenceBroadcaster;
use crate::registry::{ConnectionRegistry, RegistryError};
use parley_protocol::ServerEvent;
use std::sync::Arc;
use tracing::{debug, info};

/// Authenticates connections.
#[derive(Clone)]
pub struct AuthGate {
    registry: Arc<ConnectionRegistry>,
    identity: Arc<dyn IdentityResolver>,
    presence: PresenceBroadcaster,
}

impl AuthGate {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        identity: Arc<dyn IdentityResolver>,
        presence: PresenceBroadcaster,
    ) -> Self {
        Self {
            registry,
            identity,
            presence,
        }
    }

    /// Authenticate a connection with a raw token.
    ///
    /// The outcome is always reported to the connection as `auth_success` or
    /// `auth_error`. A failure leaves the registry untouched and the client
    /// may retry.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] that was reported to the connection.
    pub async fn authenticate(
        &self,
        conn: &ConnectionId,
        token: Option<&str>,
    ) -> Result<UserIdentity, AuthError> {
        let was_authorized = self.registry.is_authorized(conn);

        match self.bind(conn, token).await {
            Ok(identity) => {
                self.registry.send_to(
                    conn,
                    ServerEvent::AuthSuccess {
                        user_id: identity.id,
                        username: identity.username.clone(),
                    },
                );
                if was_authorized {
                    debug!(connection = %conn, user = %identity.id, "Repeated auth for same user");
                } else {
                    info!(connection = %conn, user = %identity.id, username = %identity.username, "Authenticated");
                    self.presence.announce(identity.id, true).await;
                }
                Ok(identity)
            }
            Err(e) => {
                debug!(connection = %conn, error = %e, "Authentication failed");
                self.registry
                    .send_to(conn, ServerEvent::AuthError { error: e.to_string() });
                Err(e)
            }
        }
    }

    async fn bind(
        &self,
        conn: &ConnectionId,
        token: Option<&str>,
    ) -> Result<UserIdentity, AuthError> {
        let token = token.and_then(normalize_token).ok_or(AuthError::MissingToken)?;
        let identity = self.identity.resolve(&token).await?;

        match self.registry.promote(conn, identity.clone()) {
            Ok(_) => Ok(identity),
            Err(RegistryError::UnknownConnection(_)) => Err(AuthError::ConnectionClosed),
            Err(RegistryError::AlreadyAuthenticated(_)) => Err(AuthError::AlreadyAuthenticated),
        }
    }
}
