//! Connection handles.
//!
//! A connection is owned by its transport task. Everything else in the relay
//! talks to it through a [`ConnectionHandle`], which queues outbound events
//! onto the task's mailbox without blocking.

use parley_protocol::{ServerEvent, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
}

impl UserIdentity {
    #[must_use]
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Instruction queued for a connection task.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Write an event to the client.
    Event(Arc<ServerEvent>),
    /// Close the transport. Sent when a newer session supersedes this one.
    Close,
}

/// Sending side of a connection's mailbox.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    /// Create a handle and the mailbox its transport task drains.
    #[must_use]
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Get the connection's identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue an event. Returns `false` if the connection is already gone,
    /// which callers treat as a normal outcome rather than a fault.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.send_shared(Arc::new(event))
    }

    /// Queue a shared event, avoiding a clone when fanning out.
    pub fn send_shared(&self, event: Arc<ServerEvent>) -> bool {
        self.tx.send(Outgoing::Event(event)).is_ok()
    }

    /// Ask the transport task to close the connection.
    pub fn close(&self) -> bool {
        self.tx.send(Outgoing::Close).is_ok()
    }

    /// Whether the transport task has stopped draining the mailbox.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_mailbox() {
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::new("c1"));

        assert!(handle.send(ServerEvent::Pong {}));
        assert!(matches!(rx.recv().await, Some(Outgoing::Event(_))));

        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.send(ServerEvent::Pong {}));
        assert!(!handle.close());
    }
}
