//! Persistent entities the relay reads and writes through the store.

use chrono::{DateTime, Utc};
use parley_protocol::{MediaKind, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Public profile of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar_url: Option<String>,
}

/// Online state of a user as last recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// A message to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: UserId,
    pub content: String,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Active,
    Declined,
    Ended,
}

impl CallStatus {
    /// Storage name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Active => "active",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Ended)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CallStatus::Pending),
            "active" => Ok(CallStatus::Active),
            "declined" => Ok(CallStatus::Declined),
            "ended" => Ok(CallStatus::Ended),
            other => Err(format!("unknown call status `{other}`")),
        }
    }
}

/// A call state change that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid call transition {from} -> {to}")]
pub struct TransitionError {
    pub from: CallStatus,
    pub to: CallStatus,
}

/// Reason recorded when a call ends without one.
pub const DEFAULT_END_REASON: &str = "user_ended";

/// A call between exactly two users.
///
/// Allowed transitions: `pending -> active`, `pending -> declined`, and
/// `pending | active -> ended`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Initiator-supplied id, unique for the call's lifetime.
    pub id: String,
    pub chat_id: String,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media: MediaKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds between answer and hang-up.
    pub duration: Option<i64>,
    pub end_reason: Option<String>,
}

impl Call {
    /// Create a pending call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        caller_id: UserId,
        receiver_id: UserId,
        media: MediaKind,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            caller_id,
            receiver_id,
            media,
            status: CallStatus::Pending,
            started_at,
            connected_at: None,
            ended_at: None,
            duration: None,
            end_reason: None,
        }
    }

    /// Whether the user is the caller or the receiver.
    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        user == self.caller_id || user == self.receiver_id
    }

    /// The participant who is not `user`, or `None` if `user` is not part of
    /// the call.
    #[must_use]
    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        if user == self.caller_id {
            Some(self.receiver_id)
        } else if user == self.receiver_id {
            Some(self.caller_id)
        } else {
            None
        }
    }

    /// `pending -> active`.
    ///
    /// # Errors
    ///
    /// Fails unless the call is pending.
    pub fn answer(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check(CallStatus::Active, self.status == CallStatus::Pending)?;
        self.status = CallStatus::Active;
        self.connected_at = Some(at);
        Ok(())
    }

    /// `pending -> declined`.
    ///
    /// # Errors
    ///
    /// Fails unless the call is pending.
    pub fn decline(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check(CallStatus::Declined, self.status == CallStatus::Pending)?;
        self.status = CallStatus::Declined;
        self.ended_at = Some(at);
        Ok(())
    }

    /// `pending | active -> ended`. Returns the duration in seconds if the
    /// call was ever answered.
    ///
    /// # Errors
    ///
    /// Fails if the call is already terminal.
    pub fn end(
        &mut self,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<Option<i64>, TransitionError> {
        self.check(CallStatus::Ended, !self.status.is_terminal())?;
        let duration = self
            .connected_at
            .map(|connected| (at - connected).num_seconds().max(0));
        self.status = CallStatus::Ended;
        self.ended_at = Some(at);
        self.duration = duration;
        self.end_reason = Some(reason.into());
        Ok(duration)
    }

    fn check(&self, to: CallStatus, allowed: bool) -> Result<(), TransitionError> {
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }
}
