//! Chat message relay.
//!
//! A message is persisted first and only then forwarded. Each other
//! participant of the chat gets the message on their live connection, if
//! any, and exactly one push attempt regardless. The sender gets a
//! `message_sent` receipt, or a `message_error` if nothing was relayed.

use crate::connection::{ConnectionId, UserIdentity};
use crate::error::RelayError;
use crate::model::NewMessage;
use crate::push::PushGateway;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use chrono::{SecondsFormat, Utc};
use parley_protocol::{ChatMessage, MessageId, ServerEvent, UserId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relays chat messages and read receipts.
#[derive(Clone)]
pub struct MessageRelay {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    push: Arc<dyn PushGateway>,
}

impl MessageRelay {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            registry,
            store,
            push,
        }
    }

    /// Persist a message and relay it to the other participants of its chat.
    ///
    /// # Errors
    ///
    /// Fails if the message is empty, the chat is unknown, the sender is not
    /// a participant, or the message could not be persisted. The sender is
    /// sent a `message_error` and nothing is relayed in each case.
    pub async fn send_message(
        &self,
        conn: &ConnectionId,
        sender: &UserIdentity,
        chat_id: &str,
        content: &str,
        temp_id: Option<Value>,
    ) -> Result<MessageId, RelayError> {
        let reject = |error: &str| {
            self.registry.send_to(
                conn,
                ServerEvent::MessageError {
                    chat_id: chat_id.to_string(),
                    temp_id: temp_id.clone(),
                    error: error.to_string(),
                },
            );
        };

        if chat_id.trim().is_empty() || content.trim().is_empty() {
            reject("Message is empty");
            return Err(RelayError::InvalidRequest(
                "send_message requires chatId and content".into(),
            ));
        }

        let participants = match self.store.chat_participants(chat_id).await {
            Ok(Some(participants)) => participants,
            Ok(None) => {
                reject("Chat not found");
                return Err(RelayError::not_found("chat", chat_id));
            }
            Err(e) => {
                reject("Message could not be saved");
                return Err(e.into());
            }
        };

        if !participants.contains(&sender.id) {
            reject("Not a participant of this chat");
            return Err(RelayError::NotParticipant {
                user: sender.id,
                target: format!("chat {chat_id}"),
            });
        }

        let recipients: Vec<UserId> = participants
            .into_iter()
            .filter(|participant| *participant != sender.id)
            .collect();
        if recipients.is_empty() {
            reject("Chat has no other participants");
            return Err(RelayError::InvalidRequest(format!(
                "chat {chat_id} has no recipient"
            )));
        }

        let stored = match self
            .store
            .insert_message(NewMessage {
                chat_id: chat_id.to_string(),
                sender_id: sender.id,
                content: content.to_string(),
            })
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                reject("Message could not be saved");
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.touch_chat_last_message(&stored).await {
            warn!(chat = %chat_id, error = %e, "Failed to update chat summary");
        }

        let (sender_name, sender_avatar) = match self.store.user_profile(sender.id).await {
            Ok(Some(profile)) => (profile.username, profile.avatar_url),
            Ok(None) => (sender.username.clone(), None),
            Err(e) => {
                warn!(user = %sender.id, error = %e, "Failed to load sender profile");
                (sender.username.clone(), None)
            }
        };
        let timestamp = stored.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);

        for recipient in &recipients {
            let delivered = self.registry.send_to_user(
                *recipient,
                ServerEvent::NewMessage {
                    chat_id: chat_id.to_string(),
                    message: ChatMessage {
                        id: stored.id,
                        temp_id: temp_id.clone(),
                        content: stored.content.clone(),
                        sender_id: sender.id,
                        receiver_id: *recipient,
                        message_type: "text".into(),
                        is_read: false,
                        timestamp: timestamp.clone(),
                        sender_name: sender_name.clone(),
                        sender_avatar: sender_avatar.clone(),
                    },
                },
            );

            let pushed = self
                .push
                .notify_new_message(
                    *recipient,
                    chat_id,
                    &sender_name,
                    &stored.content,
                    sender_avatar.as_deref(),
                )
                .await;
            if !pushed {
                debug!(user = %recipient, message = %stored.id, "Message push not delivered");
            }
            debug!(user = %recipient, message = %stored.id, delivered, "Message relayed");
        }

        self.registry.send_to(
            conn,
            ServerEvent::MessageSent {
                chat_id: chat_id.to_string(),
                temp_id,
                message_id: stored.id,
                timestamp,
            },
        );

        info!(
            chat = %chat_id,
            sender = %sender.id,
            message = %stored.id,
            recipients = recipients.len(),
            "Message sent"
        );
        Ok(stored.id)
    }

    /// Mark a message as read by `reader` and tell the original sender.
    ///
    /// Returns whether the receipt reached the sender's live connection.
    /// Read receipts are never pushed.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown, the reader is not a participant of
    /// its chat, or the store fails.
    pub async fn mark_read(&self, reader: UserId, message_id: MessageId) -> Result<bool, RelayError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| RelayError::not_found("message", message_id))?;

        let participants = self
            .store
            .chat_participants(&message.chat_id)
            .await?
            .unwrap_or_default();
        if !participants.contains(&reader) {
            return Err(RelayError::NotParticipant {
                user: reader,
                target: format!("chat {}", message.chat_id),
            });
        }

        self.store
            .mark_read(&message.chat_id, reader, Utc::now())
            .await?;

        if message.sender_id == reader {
            return Ok(false);
        }

        Ok(self
            .registry
            .send_to_user(message.sender_id, ServerEvent::MessageRead { message_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushNotification;
    use crate::store::MemoryStore;
    use crate::testing::{TestPeer, RecordingPushGateway};
    use serde_json::json;

    const A: UserId = UserId(1);
    const B: UserId = UserId(2);
    const C: UserId = UserId(3);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryStore>,
        push: Arc<RecordingPushGateway>,
        relay: MessageRelay,
    }

    fn fixture() -> Fixture {
        let registry = ConnectionRegistry::shared();
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        store.add_user(3, "carol");
        store.add_chat("C1", &[A, B]);
        store.add_chat("G1", &[A, B, C]);
        store.add_chat("solo", &[A]);
        let push = Arc::new(RecordingPushGateway::new());
        let relay = MessageRelay::new(Arc::clone(&registry), store.clone(), push.clone());
        Fixture {
            registry,
            store,
            push,
            relay,
        }
    }

    fn alice() -> UserIdentity {
        UserIdentity::new(1, "alice")
    }

    #[tokio::test]
    async fn test_message_to_offline_recipient_is_pushed() {
        let f = fixture();
        let mut conn = TestPeer::login(&f.registry, "a", alice());

        let id = f
            .relay
            .send_message(conn.id(), &alice(), "C1", "hi", Some(json!("t1")))
            .await
            .unwrap();

        let stored = f.store.message(id).unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(f.store.chat_last_message("C1"), Some(id));

        assert_eq!(
            f.push.for_user(B),
            vec![PushNotification::NewMessage {
                chat_id: "C1".into(),
                sender_name: "alice".into(),
                text: "hi".into(),
                sender_avatar: None,
            }]
        );

        match conn.events().as_slice() {
            [ServerEvent::MessageSent {
                temp_id,
                message_id,
                ..
            }] => {
                assert_eq!(temp_id, &Some(json!("t1")));
                assert_eq!(*message_id, id);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_to_live_recipient_is_forwarded_and_pushed() {
        let f = fixture();
        let conn = TestPeer::login(&f.registry, "a", alice());
        let mut bob = TestPeer::login(&f.registry, "b", UserIdentity::new(2, "bob"));

        f.relay
            .send_message(conn.id(), &alice(), "C1", "hi", Some(json!("t1")))
            .await
            .unwrap();

        match bob.events().as_slice() {
            [ServerEvent::NewMessage { chat_id, message }] => {
                assert_eq!(chat_id, "C1");
                assert_eq!(message.content, "hi");
                assert_eq!(message.sender_id, A);
                assert_eq!(message.receiver_id, B);
                assert_eq!(message.sender_name, "alice");
                assert_eq!(message.temp_id, Some(json!("t1")));
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(f.push.count_for(B, "new_message"), 1);
        assert_eq!(f.push.len(), 1);
    }

    #[tokio::test]
    async fn test_group_message_fans_out() {
        let f = fixture();
        let conn = TestPeer::login(&f.registry, "a", alice());
        let mut bob = TestPeer::login(&f.registry, "b", UserIdentity::new(2, "bob"));
        let mut carol = TestPeer::login(&f.registry, "c", UserIdentity::new(3, "carol"));

        f.relay
            .send_message(conn.id(), &alice(), "G1", "hello all", None)
            .await
            .unwrap();

        assert_eq!(bob.names(), vec!["new_message"]);
        assert_eq!(carol.names(), vec!["new_message"]);
        assert_eq!(f.push.count_for(B, "new_message"), 1);
        assert_eq!(f.push.count_for(C, "new_message"), 1);
        assert_eq!(f.push.count_for(A, "new_message"), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_aborts_relay() {
        let f = fixture();
        let mut conn = TestPeer::login(&f.registry, "a", alice());
        let mut bob = TestPeer::login(&f.registry, "b", UserIdentity::new(2, "bob"));
        f.store.set_message_failure(true);

        let err = f
            .relay
            .send_message(conn.id(), &alice(), "C1", "hi", Some(json!(7)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));

        assert_eq!(
            conn.events(),
            vec![ServerEvent::MessageError {
                chat_id: "C1".into(),
                temp_id: Some(json!(7)),
                error: "Message could not be saved".into()
            }]
        );
        assert!(bob.events().is_empty());
        assert!(f.push.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_sends() {
        let f = fixture();
        let mut conn = TestPeer::login(&f.registry, "a", alice());
        let carol = UserIdentity::new(3, "carol");

        assert!(f
            .relay
            .send_message(conn.id(), &alice(), "nope", "hi", None)
            .await
            .unwrap_err()
            .is_benign());
        assert!(f
            .relay
            .send_message(conn.id(), &alice(), "C1", "   ", None)
            .await
            .is_err());
        assert!(f
            .relay
            .send_message(conn.id(), &carol, "C1", "hi", None)
            .await
            .is_err());
        assert!(f
            .relay
            .send_message(conn.id(), &alice(), "solo", "hi", None)
            .await
            .is_err());

        assert_eq!(conn.names(), vec!["message_error"; 4]);
        assert_eq!(f.store.message_count(), 0);
        assert!(f.push.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_notifies_sender() {
        let f = fixture();
        let mut alice_conn = TestPeer::login(&f.registry, "a", alice());
        let id = f
            .relay
            .send_message(alice_conn.id(), &alice(), "C1", "hi", None)
            .await
            .unwrap();
        alice_conn.events();

        assert!(f.relay.mark_read(B, id).await.unwrap());
        assert_eq!(
            alice_conn.events(),
            vec![ServerEvent::MessageRead { message_id: id }]
        );
        assert!(f.store.last_read("C1", B).is_some());
        // No push for read receipts.
        assert_eq!(f.push.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_edge_cases() {
        let f = fixture();
        let mut alice_conn = TestPeer::login(&f.registry, "a", alice());
        let id = f
            .relay
            .send_message(alice_conn.id(), &alice(), "C1", "hi", None)
            .await
            .unwrap();
        alice_conn.events();

        assert!(f
            .relay
            .mark_read(B, MessageId(999))
            .await
            .unwrap_err()
            .is_benign());
        assert!(matches!(
            f.relay.mark_read(C, id).await,
            Err(RelayError::NotParticipant { .. })
        ));
        // Reading your own message updates the marker but notifies nobody.
        assert!(!f.relay.mark_read(A, id).await.unwrap());
        assert!(alice_conn.events().is_empty());
        assert!(f.store.last_read("C1", A).is_some());
    }
}
