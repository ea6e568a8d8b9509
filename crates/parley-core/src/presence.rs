//! Presence broadcasting and typing relay.
//!
//! Presence is derived from the registry: a user is online while one of
//! their connections owns the session. Changes are recorded in the store and
//! pushed to the live connections of everyone who shares a chat with the
//! user. Nothing is queued for offline users.
//!
//! Announcements for one user are serialized, and each re-checks the
//! registry before writing, so a slow offline write cannot land after the
//! online announcement of a newer session.

use crate::connection::UserIdentity;
use crate::error::RelayError;
use crate::locks::KeyedLocks;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use chrono::Utc;
use parley_protocol::{ServerEvent, UserId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Broadcasts presence changes and typing indicators.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    locks: Arc<KeyedLocks<UserId>>,
}

impl PresenceBroadcaster {
    /// Create a new broadcaster.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Record and broadcast a user's online state.
    ///
    /// Skipped when the registry no longer agrees with `online`: the session
    /// changed meanwhile and its own announcement follows.
    ///
    /// Returns the number of live connections notified.
    pub async fn announce(&self, user: UserId, online: bool) -> usize {
        let _guard = self.locks.lock(&user).await;
        if self.registry.lookup(user).is_some() != online {
            debug!(user = %user, online, "Stale presence change skipped");
            return 0;
        }

        if let Err(e) = self.store.set_presence(user, online, Utc::now()).await {
            warn!(user = %user, error = %e, "Failed to record presence");
        }

        let members = match self.store.co_chat_members(user).await {
            Ok(members) => members,
            Err(e) => {
                warn!(user = %user, error = %e, "Failed to load co-chat members");
                return 0;
            }
        };

        let event = Arc::new(ServerEvent::presence(user, online));
        let notified = members
            .into_iter()
            .filter_map(|member| self.registry.lookup(member))
            .filter(|handle| handle.send_shared(Arc::clone(&event)))
            .count();

        debug!(user = %user, online, notified, "Presence announced");
        notified
    }

    /// Forward a typing indicator to the other participants of a chat.
    ///
    /// Returns the number of live connections notified.
    ///
    /// # Errors
    ///
    /// Returns an error if the chat does not exist, the sender is not one of
    /// its participants, or the store fails.
    pub async fn relay_typing(
        &self,
        from: &UserIdentity,
        chat_id: &str,
        is_typing: bool,
    ) -> Result<usize, RelayError> {
        let participants = self
            .store
            .chat_participants(chat_id)
            .await?
            .ok_or_else(|| RelayError::not_found("chat", chat_id))?;

        if !participants.contains(&from.id) {
            return Err(RelayError::NotParticipant {
                user: from.id,
                target: format!("chat {chat_id}"),
            });
        }

        let event = if is_typing {
            ServerEvent::Typing {
                chat_id: chat_id.to_string(),
                user_id: from.id,
                user_name: from.username.clone(),
                is_typing: true,
            }
        } else {
            ServerEvent::StoppedTyping {
                chat_id: chat_id.to_string(),
                user_id: from.id,
                user_name: from.username.clone(),
                is_typing: false,
            }
        };
        let event = Arc::new(event);

        Ok(participants
            .into_iter()
            .filter(|participant| *participant != from.id)
            .filter_map(|participant| self.registry.lookup(participant))
            .filter(|handle| handle.send_shared(Arc::clone(&event)))
            .count())
    }
}
