//! Push fallback gateway.
//!
//! Push is a single best-effort attempt per user per event. Gateways report
//! success as a `bool` and never fail the caller; handlers log a `false` and
//! carry on.

use async_trait::async_trait;
use parley_protocol::{MediaKind, UserId};
use tracing::info;

/// Longest message preview put in a notification body, in characters.
pub const PREVIEW_CHARS: usize = 100;

/// An out-of-band notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushNotification {
    NewMessage {
        chat_id: String,
        sender_name: String,
        text: String,
        sender_avatar: Option<String>,
    },
    IncomingCall {
        call_id: String,
        caller_name: String,
        media: MediaKind,
        caller_avatar: Option<String>,
    },
    /// Dismisses any notification still showing for the call.
    CallEnded { call_id: String },
}

impl PushNotification {
    /// Notification kind as sent in the data payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PushNotification::NewMessage { .. } => "new_message",
            PushNotification::IncomingCall { .. } => "incoming_call",
            PushNotification::CallEnded { .. } => "call_ended",
        }
    }

    /// Title line shown to the user, if the notification is visible.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        match self {
            PushNotification::NewMessage { sender_name, .. } => Some(sender_name.clone()),
            PushNotification::IncomingCall {
                caller_name, media, ..
            } => Some(match media {
                MediaKind::Audio => format!("Audio call from {caller_name}"),
                MediaKind::Video => format!("Video call from {caller_name}"),
            }),
            PushNotification::CallEnded { .. } => None,
        }
    }

    /// Body line shown to the user, if the notification is visible.
    #[must_use]
    pub fn body(&self) -> Option<String> {
        match self {
            PushNotification::NewMessage { text, .. } => Some(preview(text, PREVIEW_CHARS)),
            PushNotification::IncomingCall { media, .. } => Some(match media {
                MediaKind::Audio => "Incoming call".to_string(),
                MediaKind::Video => "Incoming video call".to_string(),
            }),
            PushNotification::CallEnded { .. } => None,
        }
    }
}

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
#[must_use]
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Best-effort out-of-band delivery to a user.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Deliver a notification. Returns `false` if nothing was delivered.
    async fn push(&self, user: UserId, notification: PushNotification) -> bool;

    async fn notify_new_message(
        &self,
        user: UserId,
        chat_id: &str,
        sender_name: &str,
        text: &str,
        sender_avatar: Option<&str>,
    ) -> bool {
        self.push(
            user,
            PushNotification::NewMessage {
                chat_id: chat_id.to_string(),
                sender_name: sender_name.to_string(),
                text: text.to_string(),
                sender_avatar: sender_avatar.map(str::to_string),
            },
        )
        .await
    }

    async fn notify_incoming_call(
        &self,
        user: UserId,
        call_id: &str,
        caller_name: &str,
        media: MediaKind,
        caller_avatar: Option<&str>,
    ) -> bool {
        self.push(
            user,
            PushNotification::IncomingCall {
                call_id: call_id.to_string(),
                caller_name: caller_name.to_string(),
                media,
                caller_avatar: caller_avatar.map(str::to_string),
            },
        )
        .await
    }

    async fn notify_call_ended(&self, user: UserId, call_id: &str) -> bool {
        self.push(
            user,
            PushNotification::CallEnded {
                call_id: call_id.to_string(),
            },
        )
        .await
    }
}

/// Gateway that only logs each attempt. Used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPushGateway;

#[async_trait]
impl PushGateway for LoggingPushGateway {
    async fn push(&self, user: UserId, notification: PushNotification) -> bool {
        info!(
            user = %user,
            kind = notification.kind(),
            title = notification.title().as_deref().unwrap_or(""),
            body = notification.body().as_deref().unwrap_or(""),
            "Push notification"
        );
        true
    }
}
