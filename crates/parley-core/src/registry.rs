//! Connection registry for Parley.
//!
//! The registry is the relay's only shared mutable in-memory state. It maps
//! live connections to the identities they authenticated as, and user ids
//! back to the single connection that currently represents them.

use crate::connection::{ConnectionHandle, ConnectionId, UserIdentity};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{ServerEvent, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection is not attached (already closed).
    #[error("Connection not attached: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection already authenticated as another user.
    #[error("Connection already authenticated as user {0}")]
    AlreadyAuthenticated(UserId),
}

/// Per-connection state.
#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    identity: Option<UserIdentity>,
    current_chat: Option<String>,
    /// Set once a newer session for the same user evicted this connection.
    closing: bool,
    attached_at: DateTime<Utc>,
}

/// Snapshot of a connection's state.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// The identity, if the connection authenticated.
    pub identity: Option<UserIdentity>,
    /// The chat the client currently has focused.
    pub current_chat: Option<String>,
    /// Whether the connection has been superseded and is shutting down.
    pub closing: bool,
    /// When the transport was accepted.
    pub attached_at: DateTime<Utc>,
}

/// Result of detaching a connection.
#[derive(Debug, Clone)]
pub struct Detached {
    /// The identity the connection had authenticated as, if any.
    pub identity: Option<UserIdentity>,
    /// Whether the connection still represented its user when it left.
    /// `false` for a connection that was superseded by a newer login.
    pub owned_session: bool,
}

/// The connection registry.
///
/// Both maps are concurrent, so attach/detach/lookup from many connection
/// tasks never serialize on a global lock. Shard guards are never held
/// across the two maps at once.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Live connections indexed by connection id.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Sessions: user id -> the connection that represents the user.
    users: DashMap<UserId, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a freshly accepted, unauthenticated connection.
    ///
    /// Idempotent per connection id: returns `false` if it was already attached.
    pub fn attach(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id().clone();
        let mut inserted = false;
        self.connections.entry(id.clone()).or_insert_with(|| {
            inserted = true;
            ConnectionEntry {
                handle,
                identity: None,
                current_chat: None,
                closing: false,
                attached_at: Utc::now(),
            }
        });

        if inserted {
            debug!(connection = %id, total = self.connections.len(), "Connection attached");
        }
        inserted
    }

    /// Bind a connection to an authenticated identity.
    ///
    /// Any other connection that currently represents the same user is
    /// marked as closing, told to close, and returned. The user -> connection
    /// swap is a single atomic map operation, so of two simultaneous logins
    /// for one user exactly one ends up owning the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone or already bound to a
    /// different user.
    pub fn promote(
        &self,
        id: &ConnectionId,
        identity: UserIdentity,
    ) -> Result<Option<ConnectionHandle>, RegistryError> {
        let user_id = identity.id;

        {
            let mut entry = self
                .connections
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
            if let Some(current) = &entry.identity {
                if current.id != user_id {
                    return Err(RegistryError::AlreadyAuthenticated(current.id));
                }
            }
            entry.identity = Some(identity);
        }

        let previous = self.users.insert(user_id, id.clone());

        // The connection may have detached while we were swapping it in.
        if !self.connections.contains_key(id) {
            self.users.remove_if(&user_id, |_, current| current == id);
            return Err(RegistryError::UnknownConnection(id.clone()));
        }

        let evicted = match previous {
            Some(previous) if &previous != id => {
                self.connections.get_mut(&previous).map(|mut entry| {
                    entry.closing = true;
                    entry.handle.clone()
                })
            }
            _ => None,
        };

        if let Some(handle) = &evicted {
            info!(
                user = %user_id,
                previous = %handle.id(),
                connection = %id,
                "Superseding existing session"
            );
            handle.close();
        }

        Ok(evicted)
    }

    /// Find the live connection that represents a user.
    #[must_use]
    pub fn lookup(&self, user: UserId) -> Option<ConnectionHandle> {
        let connection = self.users.get(&user)?.value().clone();
        self.connections
            .get(&connection)
            .filter(|entry| !entry.closing)
            .map(|entry| entry.handle.clone())
    }

    /// Get a snapshot of a connection's state.
    #[must_use]
    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(id).map(|entry| ConnectionState {
            identity: entry.identity.clone(),
            current_chat: entry.current_chat.clone(),
            closing: entry.closing,
            attached_at: entry.attached_at,
        })
    }

    /// Check whether a connection is authorized.
    #[must_use]
    pub fn is_authorized(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .map(|entry| entry.identity.is_some())
            .unwrap_or(false)
    }

    /// Queue an event on a specific connection.
    ///
    /// Returns `false` if the connection is gone.
    pub fn send_to(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        let handle = self.connections.get(id).map(|entry| entry.handle.clone());
        match handle {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Queue an event on a user's live connection, if any.
    ///
    /// Returns `true` if the event was handed to a live connection.
    pub fn send_to_user(&self, user: UserId, event: ServerEvent) -> bool {
        match self.lookup(user) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Record which chat a connection has focused. `None` clears it.
    ///
    /// Returns `false` if the connection is gone.
    pub fn set_current_chat(&self, id: &ConnectionId, chat_id: Option<String>) -> bool {
        match self.connections.get_mut(id) {
            Some(mut entry) => {
                entry.current_chat = chat_id;
                true
            }
            None => false,
        }
    }

    /// Remove a connection.
    ///
    /// Idempotent: returns `None` if the connection was not attached. The
    /// user mapping is only removed if it still points at this connection,
    /// so a superseded connection never tears down its successor's session.
    pub fn detach(&self, id: &ConnectionId) -> Option<Detached> {
        let (_, entry) = self.connections.remove(id)?;

        let owned_session = match &entry.identity {
            Some(identity) => self
                .users
                .remove_if(&identity.id, |_, current| current == id)
                .is_some(),
            None => false,
        };

        if entry.identity.is_some() && !owned_session {
            warn!(connection = %id, "Detached superseded connection");
        } else {
            debug!(connection = %id, total = self.connections.len(), "Connection detached");
        }

        Some(Detached {
            identity: entry.identity,
            owned_session,
        })
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            authenticated_count: self.users.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of attached connections.
    pub connection_count: usize,
    /// Number of users with a live session.
    pub authenticated_count: usize,
}
