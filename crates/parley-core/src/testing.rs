//! Test doubles for handlers and the server.
//!
//! Enabled inside this crate's tests and, for dependents, through the
//! `test-util` feature.

use crate::connection::{ConnectionHandle, ConnectionId, Outgoing, UserIdentity};
use crate::push::{PushGateway, PushNotification};
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use parley_protocol::{ServerEvent, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Push gateway that records every attempt.
#[derive(Debug, Default)]
pub struct RecordingPushGateway {
    records: Mutex<Vec<(UserId, PushNotification)>>,
    failing: AtomicBool,
}

impl RecordingPushGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent attempts report failure. Attempts are still recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every attempt so far, in order.
    #[must_use]
    pub fn records(&self) -> Vec<(UserId, PushNotification)> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Attempts addressed to `user`.
    #[must_use]
    pub fn for_user(&self, user: UserId) -> Vec<PushNotification> {
        self.records()
            .into_iter()
            .filter(|(to, _)| *to == user)
            .map(|(_, notification)| notification)
            .collect()
    }

    /// Number of attempts addressed to `user` with the given kind.
    #[must_use]
    pub fn count_for(&self, user: UserId, kind: &str) -> usize {
        self.for_user(user)
            .iter()
            .filter(|notification| notification.kind() == kind)
            .count()
    }

    /// Total number of attempts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn push(&self, user: UserId, notification: PushNotification) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((user, notification));
        !self.failing.load(Ordering::SeqCst)
    }
}

/// The receiving end of a registered connection, for inspecting what the
/// relay queued on it.
#[derive(Debug)]
pub struct TestPeer {
    pub handle: ConnectionHandle,
    rx: mpsc::UnboundedReceiver<Outgoing>,
    closed: bool,
}

impl TestPeer {
    /// Create an unregistered connection.
    #[must_use]
    pub fn new(id: &str) -> Self {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(id));
        Self {
            handle,
            rx,
            closed: false,
        }
    }

    /// Create a connection and attach it to the registry.
    #[must_use]
    pub fn attach(registry: &ConnectionRegistry, id: &str) -> Self {
        let peer = Self::new(id);
        registry.attach(peer.handle.clone());
        peer
    }

    /// Create a connection already authenticated as `identity`, bypassing
    /// presence and identity resolution.
    #[must_use]
    pub fn login(registry: &ConnectionRegistry, id: &str, identity: UserIdentity) -> Self {
        let peer = Self::attach(registry, id);
        // The connection was attached just above.
        let _ = registry.promote(peer.id(), identity);
        peer
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Drain all queued events.
    pub fn events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outgoing) = self.rx.try_recv() {
            match outgoing {
                Outgoing::Event(event) => events.push((*event).clone()),
                Outgoing::Close => self.closed = true,
            }
        }
        events
    }

    /// Drain queued events and return the names, in order.
    pub fn names(&mut self) -> Vec<&'static str> {
        self.events().iter().map(ServerEvent::name).collect()
    }

    /// Whether a close instruction has been received. Discards pending
    /// events.
    pub fn was_closed(&mut self) -> bool {
        while let Ok(outgoing) = self.rx.try_recv() {
            if matches!(outgoing, Outgoing::Close) {
                self.closed = true;
            }
        }
        self.closed
    }
}
