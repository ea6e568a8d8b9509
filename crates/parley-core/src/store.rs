//! Durable store interface.
//!
//! The relay treats persistence as an external collaborator. Handlers only
//! talk to the [`Store`] trait; the server picks an implementation at
//! startup (PostgreSQL in production, [`MemoryStore`] otherwise).

use crate::model::{Call, NewMessage, PresenceRecord, StoredMessage, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{MessageId, UserId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A row the write depends on does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A row with the same key already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend failed or could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Relational persistence for users, chats, messages and calls.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a user's public profile.
    async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>, StoreError>;

    /// Record a user's online state.
    async fn set_presence(
        &self,
        user: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Users other than `user` who share at least one chat with them.
    async fn co_chat_members(&self, user: UserId) -> Result<Vec<UserId>, StoreError>;

    /// Participants of a chat, or `None` if the chat does not exist.
    async fn chat_participants(&self, chat_id: &str) -> Result<Option<Vec<UserId>>, StoreError>;

    /// Persist a message and return it with its assigned id.
    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Point the chat's last-message summary at a message.
    async fn touch_chat_last_message(&self, message: &StoredMessage) -> Result<(), StoreError>;

    /// Load a message by id.
    async fn find_message(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError>;

    /// Advance a participant's last-read marker for a chat.
    async fn mark_read(
        &self,
        chat_id: &str,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Create a call row.
    ///
    /// Fails with [`StoreError::NotFound`] if the chat does not exist and
    /// [`StoreError::Conflict`] if the call id is taken.
    async fn insert_call(&self, call: &Call) -> Result<(), StoreError>;

    /// Load a call by id.
    async fn find_call(&self, call_id: &str) -> Result<Option<Call>, StoreError>;

    /// Persist a call's status, timestamps, duration and end reason.
    async fn update_call(&self, call: &Call) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct ChatRecord {
    participants: Vec<UserId>,
    last_message: Option<MessageId>,
}

/// In-memory [`Store`].
///
/// Used by tests and when the server runs without a database.
#[derive(Debug)]
pub struct MemoryStore {
    users: DashMap<UserId, UserProfile>,
    presence: DashMap<UserId, PresenceRecord>,
    chats: DashMap<String, ChatRecord>,
    last_read: DashMap<(String, UserId), DateTime<Utc>>,
    messages: DashMap<MessageId, StoredMessage>,
    calls: DashMap<String, Call>,
    next_message_id: AtomicI64,
    fail_messages: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            presence: DashMap::new(),
            chats: DashMap::new(),
            last_read: DashMap::new(),
            messages: DashMap::new(),
            calls: DashMap::new(),
            next_message_id: AtomicI64::new(1),
            fail_messages: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(&self, id: impl Into<UserId>, username: impl Into<String>) {
        let id = id.into();
        self.users.insert(
            id,
            UserProfile {
                id,
                username: username.into(),
                avatar_url: None,
            },
        );
    }

    /// Set a user's avatar.
    pub fn set_avatar(&self, id: UserId, url: impl Into<String>) {
        if let Some(mut user) = self.users.get_mut(&id) {
            user.avatar_url = Some(url.into());
        }
    }

    /// Add or replace a chat with the given participants.
    pub fn add_chat(&self, chat_id: impl Into<String>, participants: &[UserId]) {
        self.chats.insert(
            chat_id.into(),
            ChatRecord {
                participants: participants.to_vec(),
                last_message: None,
            },
        );
    }

    /// Make subsequent message inserts fail.
    pub fn set_message_failure(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    /// Recorded presence of a user.
    #[must_use]
    pub fn presence(&self, user: UserId) -> Option<PresenceRecord> {
        self.presence.get(&user).map(|record| *record)
    }

    /// Snapshot of a call.
    #[must_use]
    pub fn call(&self, call_id: &str) -> Option<Call> {
        self.calls.get(call_id).map(|call| call.clone())
    }

    /// Replace a call row as-is.
    pub fn put_call(&self, call: Call) {
        self.calls.insert(call.id.clone(), call);
    }

    /// Snapshot of a message.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<StoredMessage> {
        self.messages.get(&id).map(|message| message.clone())
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// A participant's last-read marker.
    #[must_use]
    pub fn last_read(&self, chat_id: &str, user: UserId) -> Option<DateTime<Utc>> {
        self.last_read
            .get(&(chat_id.to_string(), user))
            .map(|at| *at)
    }

    /// The chat's last-message pointer.
    #[must_use]
    pub fn chat_last_message(&self, chat_id: &str) -> Option<MessageId> {
        self.chats.get(chat_id).and_then(|chat| chat.last_message)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.users.get(&user).map(|profile| profile.clone()))
    }

    async fn set_presence(
        &self,
        user: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.presence.insert(
            user,
            PresenceRecord {
                online,
                last_seen: at,
            },
        );
        Ok(())
    }

    async fn co_chat_members(&self, user: UserId) -> Result<Vec<UserId>, StoreError> {
        let members: BTreeSet<UserId> = self
            .chats
            .iter()
            .filter(|chat| chat.participants.contains(&user))
            .flat_map(|chat| chat.participants.clone())
            .filter(|member| *member != user)
            .collect();
        Ok(members.into_iter().collect())
    }

    async fn chat_participants(&self, chat_id: &str) -> Result<Option<Vec<UserId>>, StoreError> {
        Ok(self.chats.get(chat_id).map(|chat| chat.participants.clone()))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("message insert failed".into()));
        }
        if !self.chats.contains_key(&message.chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", message.chat_id)));
        }

        let id = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst));
        let stored = StoredMessage {
            id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: Utc::now(),
            is_read: false,
        };
        self.messages.insert(id, stored.clone());
        Ok(stored)
    }

    async fn touch_chat_last_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut chat = self
            .chats
            .get_mut(&message.chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", message.chat_id)))?;
        chat.last_message = Some(message.id);
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.message(id))
    }

    async fn mark_read(
        &self,
        chat_id: &str,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.last_read.insert((chat_id.to_string(), reader), at);
        Ok(())
    }

    async fn insert_call(&self, call: &Call) -> Result<(), StoreError> {
        if !self.chats.contains_key(&call.chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", call.chat_id)));
        }

        match self.calls.entry(call.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Conflict(format!("call {}", call.id)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(call.clone());
                Ok(())
            }
        }
    }

    async fn find_call(&self, call_id: &str) -> Result<Option<Call>, StoreError> {
        Ok(self.call(call_id))
    }

    async fn update_call(&self, call: &Call) -> Result<(), StoreError> {
        let mut row = self
            .calls
            .get_mut(&call.id)
            .ok_or_else(|| StoreError::NotFound(format!("call {}", call.id)))?;
        *row = call.clone();
        Ok(())
    }
}
