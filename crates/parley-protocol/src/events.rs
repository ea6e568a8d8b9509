//! Event types for the Parley protocol.
//!
//! Every frame carries exactly one event. Events are tagged by a `type`
//! field and use camelCase field names, matching what mobile and web
//! clients already speak.

use crate::ids::{MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Media kind of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl MediaKind {
    /// Wire name of the media kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Read a media kind from a JSON value.
    ///
    /// Returns `None` for anything but `"audio"` or `"video"`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        MediaKind::deserialize(value).ok()
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Auth,
    Ping,
    Typing,
    StoppedTyping,
    SendMessage,
    MarkRead,
    JoinChat,
    LeaveChat,
    CallOffer,
    CallAnswer,
    CallIceCandidate,
    CallEnd,
    CallDecline,
}

impl EventKind {
    /// Resolve a wire `type` string. Returns `None` for kinds this relay
    /// does not understand.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "auth" => EventKind::Auth,
            "ping" => EventKind::Ping,
            "typing" => EventKind::Typing,
            "stopped_typing" => EventKind::StoppedTyping,
            "send_message" | "message" => EventKind::SendMessage,
            "mark_read" => EventKind::MarkRead,
            "join_chat" => EventKind::JoinChat,
            "leave_chat" => EventKind::LeaveChat,
            "call_offer" => EventKind::CallOffer,
            "call_answer" => EventKind::CallAnswer,
            "call_ice_candidate" => EventKind::CallIceCandidate,
            "call_end" => EventKind::CallEnd,
            "call_decline" => EventKind::CallDecline,
            _ => return None,
        };
        Some(kind)
    }

    /// Canonical wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Auth => "auth",
            EventKind::Ping => "ping",
            EventKind::Typing => "typing",
            EventKind::StoppedTyping => "stopped_typing",
            EventKind::SendMessage => "send_message",
            EventKind::MarkRead => "mark_read",
            EventKind::JoinChat => "join_chat",
            EventKind::LeaveChat => "leave_chat",
            EventKind::CallOffer => "call_offer",
            EventKind::CallAnswer => "call_answer",
            EventKind::CallIceCandidate => "call_ice_candidate",
            EventKind::CallEnd => "call_end",
            EventKind::CallDecline => "call_decline",
        }
    }

    /// Whether the kind belongs to call signaling.
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            EventKind::CallOffer
                | EventKind::CallAnswer
                | EventKind::CallIceCandidate
                | EventKind::CallEnd
                | EventKind::CallDecline
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Authenticate the connection with a bearer token.
    Auth {
        #[serde(default)]
        token: Option<String>,
    },

    /// Liveness peer.
    Ping {},

    /// The user started typing in a chat.
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: String },

    /// The user stopped typing in a chat.
    #[serde(rename_all = "camelCase")]
    StoppedTyping { chat_id: String },

    /// Send a chat message.
    #[serde(rename_all = "camelCase", alias = "message")]
    SendMessage {
        chat_id: String,
        content: String,
        /// Client-side id echoed back for optimistic UI reconciliation.
        #[serde(default)]
        temp_id: Option<Value>,
    },

    /// Mark a message as read.
    #[serde(rename_all = "camelCase")]
    MarkRead { message_id: MessageId },

    /// The client focused a chat.
    #[serde(rename_all = "camelCase")]
    JoinChat {
        #[serde(default)]
        chat_id: Option<String>,
    },

    /// The client left the focused chat.
    #[serde(rename_all = "camelCase")]
    LeaveChat {
        #[serde(default)]
        chat_id: Option<String>,
    },

    /// Start a call. Fields are validated by the call handler so that a
    /// missing field produces an error reply rather than a dropped frame.
    #[serde(rename_all = "camelCase")]
    CallOffer {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        chat_id: Option<String>,
        #[serde(default)]
        receiver_id: Option<Value>,
        #[serde(default)]
        call_type: Option<Value>,
        #[serde(default)]
        offer: Option<Value>,
    },

    /// Accept a call with a session description.
    #[serde(rename_all = "camelCase")]
    CallAnswer { call_id: String, answer: Value },

    /// Trickle an ICE candidate to the other participant.
    #[serde(rename_all = "camelCase")]
    CallIceCandidate { call_id: String, candidate: Value },

    /// Hang up.
    #[serde(rename_all = "camelCase")]
    CallEnd {
        call_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Reject an incoming call.
    #[serde(rename_all = "camelCase")]
    CallDecline { call_id: String },
}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Auth { .. } => EventKind::Auth,
            ClientEvent::Ping { .. } => EventKind::Ping,
            ClientEvent::Typing { .. } => EventKind::Typing,
            ClientEvent::StoppedTyping { .. } => EventKind::StoppedTyping,
            ClientEvent::SendMessage { .. } => EventKind::SendMessage,
            ClientEvent::MarkRead { .. } => EventKind::MarkRead,
            ClientEvent::JoinChat { .. } => EventKind::JoinChat,
            ClientEvent::LeaveChat { .. } => EventKind::LeaveChat,
            ClientEvent::CallOffer { .. } => EventKind::CallOffer,
            ClientEvent::CallAnswer { .. } => EventKind::CallAnswer,
            ClientEvent::CallIceCandidate { .. } => EventKind::CallIceCandidate,
            ClientEvent::CallEnd { .. } => EventKind::CallEnd,
            ClientEvent::CallDecline { .. } => EventKind::CallDecline,
        }
    }

    /// Create an auth event.
    #[must_use]
    pub fn auth(token: impl Into<String>) -> Self {
        ClientEvent::Auth {
            token: Some(token.into()),
        }
    }

    /// Create a ping event.
    #[must_use]
    pub fn ping() -> Self {
        ClientEvent::Ping {}
    }
}

/// Whether a call offer reached a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    /// Delivered to the receiver's live connection.
    Sent,
    /// The receiver has no live connection; only the push channel was tried.
    Offline,
}

/// A chat message as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub temp_id: Option<Value>,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Always `text` for messages relayed over the socket.
    pub message_type: String,
    pub is_read: bool,
    /// RFC 3339 creation time.
    pub timestamp: String,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
}

/// An event sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthSuccess { user_id: UserId, username: String },

    AuthError { error: String },

    Pong {},

    Error { message: String },

    #[serde(rename_all = "camelCase")]
    CallError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: UserId, is_online: bool },

    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: UserId, is_online: bool },

    #[serde(rename_all = "camelCase")]
    Typing {
        chat_id: String,
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    StoppedTyping {
        chat_id: String,
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    NewMessage { chat_id: String, message: ChatMessage },

    /// Persistence receipt for the sender of a message.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        chat_id: String,
        temp_id: Option<Value>,
        message_id: MessageId,
        timestamp: String,
    },

    /// The message could not be recorded and was not relayed.
    #[serde(rename_all = "camelCase")]
    MessageError {
        chat_id: String,
        temp_id: Option<Value>,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    MessageRead { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    CallOffer {
        call_id: String,
        chat_id: String,
        caller_id: UserId,
        caller_name: String,
        caller_avatar: Option<String>,
        call_type: MediaKind,
        offer: Value,
    },

    #[serde(rename_all = "camelCase")]
    CallOfferSent { call_id: String, status: OfferStatus },

    #[serde(rename_all = "camelCase")]
    CallAnswer { call_id: String, answer: Value },

    #[serde(rename_all = "camelCase")]
    CallIceCandidate { call_id: String, candidate: Value },

    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: String,
        reason: String,
        /// Seconds between answer and hang-up; null if never answered.
        duration: Option<i64>,
    },

    #[serde(rename_all = "camelCase")]
    CallDeclined { call_id: String },
}

impl ServerEvent {
    /// Wire name of the event, for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AuthSuccess { .. } => "auth_success",
            ServerEvent::AuthError { .. } => "auth_error",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
            ServerEvent::CallError { .. } => "call_error",
            ServerEvent::UserOnline { .. } => "user_online",
            ServerEvent::UserOffline { .. } => "user_offline",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StoppedTyping { .. } => "stopped_typing",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::MessageError { .. } => "message_error",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::CallOffer { .. } => "call_offer",
            ServerEvent::CallOfferSent { .. } => "call_offer_sent",
            ServerEvent::CallAnswer { .. } => "call_answer",
            ServerEvent::CallIceCandidate { .. } => "call_ice_candidate",
            ServerEvent::CallEnded { .. } => "call_ended",
            ServerEvent::CallDeclined { .. } => "call_declined",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Create a presence event for a user.
    #[must_use]
    pub fn presence(user_id: UserId, online: bool) -> Self {
        if online {
            ServerEvent::UserOnline {
                user_id,
                is_online: true,
            }
        } else {
            ServerEvent::UserOffline {
                user_id,
                is_online: false,
            }
        }
    }
}
