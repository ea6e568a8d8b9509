//! Error taxonomy for relay handlers.
//!
//! No handler error closes a connection. Errors are logged and, where the
//! client needs to know, turned into a reply event by the handler itself.

use crate::identity::AuthError;
use crate::model::{CallStatus, TransitionError};
use crate::store::StoreError;
use parley_protocol::UserId;
use thiserror::Error;

/// Errors raised while handling a routed event.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The event was missing a field or carried an invalid one.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A referenced chat, call, message or user does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The call already reached a terminal state.
    #[error("Call {call_id} already {status}")]
    CallFinished { call_id: String, status: CallStatus },

    /// The call is in a state that does not allow the transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The user is not a participant of the chat or call.
    #[error("User {user} is not a participant of {target}")]
    NotParticipant { user: UserId, target: String },

    /// The durable store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Authentication failed.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// The connection went away while the event was being handled.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RelayError {
    /// Build a [`RelayError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        RelayError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error comes from an expected race (late events for a
    /// finished call, a peer that already disconnected) and should only be
    /// logged at debug level.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            RelayError::NotFound { .. }
                | RelayError::CallFinished { .. }
                | RelayError::Transition(_)
                | RelayError::ConnectionClosed
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::NotFound { .. } => "not_found",
            RelayError::CallFinished { .. } => "call_finished",
            RelayError::Transition(_) => "transition",
            RelayError::NotParticipant { .. } => "not_participant",
            RelayError::Store(_) => "store",
            RelayError::Auth(_) => "auth",
            RelayError::ConnectionClosed => "connection_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_errors() {
        assert!(RelayError::not_found("call", "K1").is_benign());
        assert!(RelayError::CallFinished {
            call_id: "K1".into(),
            status: CallStatus::Ended
        }
        .is_benign());
        assert!(!RelayError::InvalidRequest("missing callId".into()).is_benign());
        assert!(!RelayError::Store(StoreError::Unavailable("down".into())).is_benign());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RelayError::not_found("call", "K1").to_string(),
            "call not found: K1"
        );
        assert_eq!(
            RelayError::CallFinished {
                call_id: "K1".into(),
                status: CallStatus::Declined
            }
            .to_string(),
            "Call K1 already declined"
        );
    }
}
