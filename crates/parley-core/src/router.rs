//! Event router for Parley.
//!
//! The router decodes one event per inbound frame and dispatches it by kind.
//! Until a connection authenticates only `auth` and `ping` are accepted,
//! plus `call_end` so that a lost session can still release a call. Broken
//! or unknown events are dropped and never close the connection.

use crate::auth::AuthGate;
use crate::calls::{CallSignaling, OfferRequest};
use crate::connection::{ConnectionHandle, ConnectionId, UserIdentity};
use crate::error::RelayError;
use crate::identity::IdentityResolver;
use crate::messages::MessageRelay;
use crate::presence::PresenceBroadcaster;
use crate::push::PushGateway;
use crate::registry::{ConnectionRegistry, Detached};
use crate::store::Store;
use parley_protocol::codec::{self, ProtocolError};
use parley_protocol::{ClientEvent, EventKind, ServerEvent};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The event was handled.
    Handled,
    /// The handler ran and reported an error.
    Failed,
    /// The connection is not allowed to send this event yet.
    Rejected,
    /// The payload was not a valid event.
    Malformed,
    /// The event kind is not known to this relay.
    Unknown,
    /// The connection is detached or superseded.
    Closing,
}

impl Dispatch {
    /// Label for metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Dispatch::Handled => "handled",
            Dispatch::Failed => "failed",
            Dispatch::Rejected => "rejected",
            Dispatch::Malformed => "malformed",
            Dispatch::Unknown => "unknown",
            Dispatch::Closing => "closing",
        }
    }
}

/// The central event router.
///
/// Holds the registry and the handlers; all per-connection state lives in
/// the registry.
#[derive(Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    auth: AuthGate,
    presence: PresenceBroadcaster,
    calls: CallSignaling,
    messages: MessageRelay,
}

impl Router {
    /// Create a router with a fresh registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        identity: Arc<dyn IdentityResolver>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        Self::with_registry(ConnectionRegistry::shared(), store, identity, push)
    }

    /// Create a router around an existing registry.
    #[must_use]
    pub fn with_registry(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        identity: Arc<dyn IdentityResolver>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        let presence = PresenceBroadcaster::new(Arc::clone(&registry), Arc::clone(&store));
        let auth = AuthGate::new(Arc::clone(&registry), identity, presence.clone());
        let calls = CallSignaling::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&push));
        let messages = MessageRelay::new(Arc::clone(&registry), store, push);
        Self {
            registry,
            auth,
            presence,
            calls,
            messages,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a freshly accepted connection.
    pub fn connect(&self, handle: ConnectionHandle) -> bool {
        self.registry.attach(handle)
    }

    /// Route a JSON text frame.
    pub async fn route_text(&self, conn: &ConnectionId, text: &str) -> Dispatch {
        self.route(conn, codec::decode_text(text)).await
    }

    /// Route a length-prefixed MessagePack frame.
    pub async fn route_binary(&self, conn: &ConnectionId, data: &[u8]) -> Dispatch {
        self.route(conn, codec::decode_binary(data)).await
    }

    /// Route a decoded event.
    pub async fn route(
        &self,
        conn: &ConnectionId,
        decoded: Result<ClientEvent, ProtocolError>,
    ) -> Dispatch {
        let event = match decoded {
            Ok(event) => event,
            Err(e) if e.is_unknown_kind() => {
                debug!(connection = %conn, error = %e, "Ignoring unknown event");
                return Dispatch::Unknown;
            }
            Err(e) => {
                debug!(connection = %conn, error = %e, "Dropping malformed event");
                return Dispatch::Malformed;
            }
        };

        let state = match self.registry.state(conn) {
            Some(state) if !state.closing => state,
            _ => {
                trace!(connection = %conn, kind = %event.kind(), "Event for closing connection");
                return Dispatch::Closing;
            }
        };
        let kind = event.kind();
        trace!(connection = %conn, kind = %kind, "Routing event");

        match (event, state.identity) {
            (ClientEvent::Auth { token }, _) => {
                match self.auth.authenticate(conn, token.as_deref()).await {
                    Ok(_) => Dispatch::Handled,
                    Err(_) => Dispatch::Failed,
                }
            }
            (ClientEvent::Ping {}, _) => {
                self.registry.send_to(conn, ServerEvent::Pong {});
                Dispatch::Handled
            }
            (ClientEvent::CallEnd { call_id, reason }, None) => {
                debug!(connection = %conn, call = %call_id, "Unauthenticated call_end");
                let result = self.calls.end(None, &call_id, reason).await;
                outcome(conn, kind, result)
            }
            (_, None) => {
                self.reject(conn, kind);
                Dispatch::Rejected
            }
            (event, Some(identity)) => self.dispatch(conn, &identity, event).await,
        }
    }

    async fn dispatch(
        &self,
        conn: &ConnectionId,
        identity: &UserIdentity,
        event: ClientEvent,
    ) -> Dispatch {
        let kind = event.kind();
        let user = identity.id;

        match event {
            ClientEvent::Auth { .. } | ClientEvent::Ping {} => Dispatch::Handled,
            ClientEvent::Typing { chat_id } => {
                let result = self.presence.relay_typing(identity, &chat_id, true).await;
                outcome(conn, kind, result)
            }
            ClientEvent::StoppedTyping { chat_id } => {
                let result = self.presence.relay_typing(identity, &chat_id, false).await;
                outcome(conn, kind, result)
            }
            ClientEvent::SendMessage {
                chat_id,
                content,
                temp_id,
            } => {
                let result = self
                    .messages
                    .send_message(conn, identity, &chat_id, &content, temp_id)
                    .await;
                outcome(conn, kind, result)
            }
            ClientEvent::MarkRead { message_id } => {
                let result = self.messages.mark_read(user, message_id).await;
                outcome(conn, kind, result)
            }
            ClientEvent::JoinChat { chat_id } => {
                if let Some(chat_id) = chat_id.filter(|id| !id.is_empty()) {
                    debug!(connection = %conn, user = %user, chat = %chat_id, "Joined chat");
                    self.registry.set_current_chat(conn, Some(chat_id));
                }
                Dispatch::Handled
            }
            ClientEvent::LeaveChat { .. } => {
                self.registry.set_current_chat(conn, None);
                Dispatch::Handled
            }
            ClientEvent::CallOffer {
                call_id,
                chat_id,
                receiver_id,
                call_type,
                offer,
            } => {
                let request = OfferRequest {
                    call_id,
                    chat_id,
                    receiver_id,
                    media: call_type,
                    offer,
                };
                let result = self.calls.offer(conn, user, request).await;
                outcome(conn, kind, result)
            }
            ClientEvent::CallAnswer { call_id, answer } => {
                let result = self.calls.answer(user, &call_id, answer).await;
                outcome(conn, kind, result)
            }
            ClientEvent::CallIceCandidate { call_id, candidate } => {
                let result = self.calls.ice_candidate(user, &call_id, candidate).await;
                outcome(conn, kind, result)
            }
            ClientEvent::CallEnd { call_id, reason } => {
                let result = self.calls.end(Some(user), &call_id, reason).await;
                outcome(conn, kind, result)
            }
            ClientEvent::CallDecline { call_id } => {
                let result = self.calls.decline(user, &call_id).await;
                outcome(conn, kind, result)
            }
        }
    }

    fn reject(&self, conn: &ConnectionId, kind: EventKind) {
        debug!(connection = %conn, kind = %kind, "Rejecting event before auth");
        let reply = if kind.is_call() {
            ServerEvent::CallError {
                call_id: None,
                error: "unauthorized".into(),
                message: Some("Authentication required".into()),
            }
        } else {
            ServerEvent::error("Not authorized")
        };
        self.registry.send_to(conn, reply);
    }

    /// Remove a connection. Announces the user offline if the connection
    /// still owned their session.
    ///
    /// Idempotent: returns `None` if the connection was already gone.
    pub async fn disconnect(&self, conn: &ConnectionId) -> Option<Detached> {
        let detached = self.registry.detach(conn)?;

        if let (true, Some(identity)) = (detached.owned_session, &detached.identity) {
            self.presence.announce(identity.id, false).await;
        }

        Some(detached)
    }
}

fn outcome<T>(conn: &ConnectionId, kind: EventKind, result: Result<T, RelayError>) -> Dispatch {
    match result {
        Ok(_) => Dispatch::Handled,
        Err(e) if e.is_benign() => {
            debug!(connection = %conn, kind = %kind, error = %e, "Event dropped");
            Dispatch::Failed
        }
        Err(e) => {
            warn!(connection = %conn, kind = %kind, error = %e, "Event failed");
            Dispatch::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityResolver;
    use crate::model::{Call, CallStatus, NewMessage, StoredMessage, UserProfile};
    use crate::store::{MemoryStore, StoreError};
    use crate::testing::{TestPeer, RecordingPushGateway};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parley_protocol::{MediaKind, MessageId, OfferStatus, UserId};
    use serde_json::json;
    use std::time::Duration;

    const A: UserId = UserId(1);
    const B: UserId = UserId(2);

    struct Fixture {
        router: Router,
        store: Arc<MemoryStore>,
        push: Arc<RecordingPushGateway>,
    }

    /// Delegates to a [`MemoryStore`], but offline writes take a while.
    struct SlowOfflineStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl Store for SlowOfflineStore {
        async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>, StoreError> {
            self.inner.user_profile(user).await
        }

        async fn set_presence(
            &self,
            user: UserId,
            online: bool,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if !online {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.set_presence(user, online, at).await
        }

        async fn co_chat_members(&self, user: UserId) -> Result<Vec<UserId>, StoreError> {
            self.inner.co_chat_members(user).await
        }

        async fn chat_participants(
            &self,
            chat_id: &str,
        ) -> Result<Option<Vec<UserId>>, StoreError> {
            self.inner.chat_participants(chat_id).await
        }

        async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
            self.inner.insert_message(message).await
        }

        async fn touch_chat_last_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
            self.inner.touch_chat_last_message(message).await
        }

        async fn find_message(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
            self.inner.find_message(id).await
        }

        async fn mark_read(
            &self,
            chat_id: &str,
            reader: UserId,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.mark_read(chat_id, reader, at).await
        }

        async fn insert_call(&self, call: &Call) -> Result<(), StoreError> {
            self.inner.insert_call(call).await
        }

        async fn find_call(&self, call_id: &str) -> Result<Option<Call>, StoreError> {
            self.inner.find_call(call_id).await
        }

        async fn update_call(&self, call: &Call) -> Result<(), StoreError> {
            self.inner.update_call(call).await
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|store| store as Arc<dyn Store>)
    }

    fn fixture_with(wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn Store>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        store.add_chat("C1", &[A, B]);

        let resolver = Arc::new(MemoryIdentityResolver::new());
        resolver.insert("token-a", UserIdentity::new(1, "alice"));
        resolver.insert("token-b", UserIdentity::new(2, "bob"));

        let push = Arc::new(RecordingPushGateway::new());
        let router = Router::new(wrap(store.clone()), resolver, push.clone());
        Fixture {
            router,
            store,
            push,
        }
    }

    async fn connect(f: &Fixture, id: &str, token: &str) -> TestPeer {
        let mut peer = TestPeer::attach(f.router.registry(), id);
        let frame = json!({"type": "auth", "token": token}).to_string();
        assert_eq!(
            f.router.route_text(peer.id(), &frame).await,
            Dispatch::Handled
        );
        assert_eq!(peer.names().first().copied(), Some("auth_success"));
        peer
    }

    async fn send(f: &Fixture, peer: &TestPeer, event: serde_json::Value) -> Dispatch {
        f.router.route_text(peer.id(), &event.to_string()).await
    }

    #[tokio::test]
    async fn test_ping_before_auth() {
        let f = fixture();
        let mut conn = TestPeer::attach(f.router.registry(), "c1");
        assert_eq!(send(&f, &conn, json!({"type": "ping"})).await, Dispatch::Handled);
        assert_eq!(conn.events(), vec![ServerEvent::Pong {}]);
    }

    #[tokio::test]
    async fn test_unauthenticated_events_are_rejected() {
        let f = fixture();
        let mut conn = TestPeer::attach(f.router.registry(), "c1");

        let dispatch = send(&f, &conn, json!({"type": "typing", "chatId": "C1"})).await;
        assert_eq!(dispatch, Dispatch::Rejected);
        let dispatch = send(
            &f,
            &conn,
            json!({"type": "call_answer", "callId": "K1", "answer": {}}),
        )
        .await;
        assert_eq!(dispatch, Dispatch::Rejected);

        assert_eq!(
            conn.events(),
            vec![
                ServerEvent::error("Not authorized"),
                ServerEvent::CallError {
                    call_id: None,
                    error: "unauthorized".into(),
                    message: Some("Authentication required".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let f = fixture();
        let mut conn = connect(&f, "c1", "token-a").await;

        assert_eq!(
            f.router.route_text(conn.id(), "{not json").await,
            Dispatch::Malformed
        );
        assert_eq!(
            send(&f, &conn, json!({"type": "typing"})).await,
            Dispatch::Malformed
        );
        assert_eq!(
            send(&f, &conn, json!({"type": "screen_share", "on": true})).await,
            Dispatch::Unknown
        );
        assert!(conn.events().is_empty());

        // The connection keeps working.
        assert_eq!(send(&f, &conn, json!({"type": "ping"})).await, Dispatch::Handled);
        assert_eq!(conn.names(), vec!["pong"]);
    }

    #[tokio::test]
    async fn test_call_scenario() {
        let f = fixture();
        let mut alice = connect(&f, "a", "token-a").await;
        let mut bob = connect(&f, "b", "token-b").await;
        alice.events();

        let dispatch = send(
            &f,
            &alice,
            json!({
                "type": "call_offer",
                "callId": "K1",
                "chatId": "C1",
                "receiverId": 2,
                "callType": "audio",
                "offer": {"type": "offer", "sdp": "v=0"}
            }),
        )
        .await;
        assert_eq!(dispatch, Dispatch::Handled);
        assert_eq!(f.store.call("K1").unwrap().status, CallStatus::Pending);
        assert_eq!(
            alice.events(),
            vec![ServerEvent::CallOfferSent {
                call_id: "K1".into(),
                status: OfferStatus::Sent
            }]
        );
        match bob.events().as_slice() {
            [ServerEvent::CallOffer {
                caller_name,
                call_type,
                offer,
                ..
            }] => {
                assert_eq!(caller_name, "alice");
                assert_eq!(*call_type, MediaKind::Audio);
                assert_eq!(offer["sdp"], "v=0");
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(f.push.count_for(B, "incoming_call"), 1);

        send(
            &f,
            &bob,
            json!({"type": "call_answer", "callId": "K1", "answer": {"sdp": "v=1"}}),
        )
        .await;
        assert_eq!(f.store.call("K1").unwrap().status, CallStatus::Active);
        assert_eq!(
            alice.events(),
            vec![ServerEvent::CallAnswer {
                call_id: "K1".into(),
                answer: json!({"sdp": "v=1"})
            }]
        );

        send(
            &f,
            &alice,
            json!({"type": "call_end", "callId": "K1", "reason": "user_ended"}),
        )
        .await;
        let call = f.store.call("K1").unwrap();
        assert_eq!(call.status, CallStatus::Ended);
        assert!(call.duration.is_some());
        assert_eq!(bob.names(), vec!["call_ended"]);

        // A second end from the other side is a quiet no-op.
        let dispatch = send(&f, &bob, json!({"type": "call_end", "callId": "K1"})).await;
        assert_eq!(dispatch, Dispatch::Failed);
        assert!(alice.events().is_empty());
        assert_eq!(f.store.call("K1").unwrap().end_reason.as_deref(), Some("user_ended"));
    }

    #[tokio::test]
    async fn test_call_end_bypasses_auth() {
        let f = fixture();
        let mut alice = connect(&f, "a", "token-a").await;
        let mut bob = connect(&f, "b", "token-b").await;
        send(
            &f,
            &alice,
            json!({
                "type": "call_offer",
                "callId": "K1",
                "chatId": "C1",
                "receiverId": "2",
                "offer": {}
            }),
        )
        .await;
        alice.events();
        bob.events();

        let stranger = TestPeer::attach(f.router.registry(), "x");
        let dispatch = send(&f, &stranger, json!({"type": "call_end", "callId": "K1"})).await;
        assert_eq!(dispatch, Dispatch::Handled);
        assert_eq!(alice.names(), vec!["call_ended"]);
        assert_eq!(bob.names(), vec!["call_ended"]);
        assert_eq!(f.store.call("K1").unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_message_scenario_offline_recipient() {
        let f = fixture();
        let mut alice = connect(&f, "a", "token-a").await;

        let dispatch = send(
            &f,
            &alice,
            json!({"type": "send_message", "chatId": "C1", "content": "hi", "tempId": "t1"}),
        )
        .await;
        assert_eq!(dispatch, Dispatch::Handled);
        assert_eq!(f.store.message_count(), 1);
        assert_eq!(alice.names(), vec!["message_sent"]);
        assert_eq!(f.push.count_for(B, "new_message"), 1);
    }

    #[tokio::test]
    async fn test_call_offer_with_odd_call_type() {
        let f = fixture();
        let mut alice = connect(&f, "a", "token-a").await;
        let offer = |call_id: &str, call_type: serde_json::Value| {
            json!({
                "type": "call_offer",
                "callId": call_id,
                "chatId": "C1",
                "receiverId": 2,
                "callType": call_type,
                "offer": {"type": "offer", "sdp": "v=0"}
            })
        };

        let dispatch = send(&f, &alice, offer("K1", serde_json::Value::Null)).await;
        assert_eq!(dispatch, Dispatch::Handled);
        assert_eq!(f.store.call("K1").unwrap().media, MediaKind::Audio);
        alice.events();

        let dispatch = send(&f, &alice, offer("K2", json!("Video"))).await;
        assert_eq!(dispatch, Dispatch::Failed);
        assert_eq!(alice.events(), vec![ServerEvent::error("Invalid call type")]);
        assert!(f.store.call("K2").is_none());
    }

    #[tokio::test]
    async fn test_slow_offline_write_does_not_override_relogin() {
        let f = fixture_with(|store| Arc::new(SlowOfflineStore { inner: store }));
        let first = connect(&f, "a1", "token-a").await;
        let mut bob = connect(&f, "b", "token-b").await;

        let disconnect = tokio::spawn({
            let router = f.router.clone();
            let id = first.id().clone();
            async move { router.disconnect(&id).await }
        });
        // Let the disconnect detach and start its offline write.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _second = connect(&f, "a2", "token-a").await;
        assert!(disconnect.await.unwrap().unwrap().owned_session);

        assert!(f.store.presence(A).unwrap().online);
        assert_eq!(bob.names().last().copied(), Some("user_online"));
        assert_eq!(f.router.registry().lookup(A).unwrap().id().as_str(), "a2");
    }

    #[tokio::test]
    async fn test_join_and_leave_chat() {
        let f = fixture();
        let alice = connect(&f, "a", "token-a").await;
        let registry = f.router.registry();

        send(&f, &alice, json!({"type": "join_chat", "chatId": "C1"})).await;
        assert_eq!(
            registry.state(alice.id()).unwrap().current_chat.as_deref(),
            Some("C1")
        );
        send(&f, &alice, json!({"type": "leave_chat", "chatId": "C1"})).await;
        assert!(registry.state(alice.id()).unwrap().current_chat.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_announces_offline_once() {
        let f = fixture();
        let alice = connect(&f, "a", "token-a").await;
        let mut bob = connect(&f, "b", "token-b").await;

        let detached = f.router.disconnect(alice.id()).await.unwrap();
        assert!(detached.owned_session);
        assert_eq!(bob.names(), vec!["user_offline"]);
        assert!(!f.store.presence(A).unwrap().online);

        assert!(f.router.disconnect(alice.id()).await.is_none());
        assert!(bob.events().is_empty());
        assert_eq!(
            send(&f, &alice, json!({"type": "ping"})).await,
            Dispatch::Closing
        );
    }

    #[tokio::test]
    async fn test_superseded_connection_leaves_quietly() {
        let f = fixture();
        let mut bob = connect(&f, "b", "token-b").await;
        let mut first = connect(&f, "a1", "token-a").await;
        let _second = connect(&f, "a2", "token-a").await;
        assert!(first.was_closed());
        bob.events();

        // Events from the superseded connection are ignored.
        assert_eq!(
            send(&f, &first, json!({"type": "typing", "chatId": "C1"})).await,
            Dispatch::Closing
        );

        let detached = f.router.disconnect(first.id()).await.unwrap();
        assert!(!detached.owned_session);
        assert!(bob.events().is_empty());
        assert!(f.store.presence(A).unwrap().online);
        assert_eq!(f.router.registry().lookup(A).unwrap().id().as_str(), "a2");
    }
}
