//! Call signaling.
//!
//! A call moves through `pending -> active | declined` and
//! `pending | active -> ended`. The authoritative state lives in the store;
//! every operation on a call id runs under that call's lock so two events
//! for the same call are never interleaved.
//!
//! Session descriptions and ICE candidates are relayed verbatim. Terminal
//! transitions are fanned out both to live connections and to the push
//! gateway, since either participant may be backgrounded.

use crate::connection::ConnectionId;
use crate::error::RelayError;
use crate::locks::KeyedLocks;
use crate::model::{Call, DEFAULT_END_REASON};
use crate::push::PushGateway;
use crate::registry::ConnectionRegistry;
use crate::store::{Store, StoreError};
use chrono::Utc;
use parley_protocol::{MediaKind, OfferStatus, ServerEvent, UserId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Advisory sent to a caller whose receiver has no live connection.
pub const RECEIVER_OFFLINE: &str = "пользователь не в сети";

/// Per-call async locks.
pub type CallLocks = KeyedLocks<String>;

/// A `call_offer` as received, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferRequest {
    pub call_id: Option<String>,
    pub chat_id: Option<String>,
    pub receiver_id: Option<Value>,
    /// Raw `callType`. Absent or null means audio.
    pub media: Option<Value>,
    pub offer: Option<Value>,
}

/// The call signaling state machine.
#[derive(Clone)]
pub struct CallSignaling {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    push: Arc<dyn PushGateway>,
    locks: Arc<CallLocks>,
}

impl CallSignaling {
    /// Create a new call signaling handler.
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
            locks: Arc::new(CallLocks::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &CallLocks {
        &self.locks
    }

    /// Start a call from `caller` on connection `conn`.
    ///
    /// Creates the call in `pending`, relays the offer to the receiver's live
    /// connection if there is one, acknowledges to the caller, and always
    /// pushes an incoming-call notification to the receiver.
    ///
    /// # Errors
    ///
    /// Fails if the request is incomplete, the caller or chat is unknown, or
    /// the call row cannot be created. The caller is sent an `error` or
    /// `call_error` reply in each case.
    pub async fn offer(
        &self,
        conn: &ConnectionId,
        caller_id: UserId,
        request: OfferRequest,
    ) -> Result<OfferStatus, RelayError> {
        let (call_id, chat_id, receiver_value, offer) = match (
            non_empty(request.call_id),
            non_empty(request.chat_id),
            request.receiver_id.filter(|v| !v.is_null()),
            request.offer,
        ) {
            (Some(call_id), Some(chat_id), Some(receiver), Some(offer)) => {
                (call_id, chat_id, receiver, offer)
            }
            _ => {
                self.registry.send_to(
                    conn,
                    ServerEvent::error("Insufficient data to start the call"),
                );
                return Err(RelayError::InvalidRequest(
                    "call_offer requires callId, chatId, receiverId and offer".into(),
                ));
            }
        };

        let receiver_id = match UserId::from_json(&receiver_value) {
            Some(id) if id != caller_id => id,
            _ => {
                self.registry
                    .send_to(conn, ServerEvent::error("Invalid receiver id"));
                return Err(RelayError::InvalidRequest(format!(
                    "invalid receiverId {receiver_value}"
                )));
            }
        };

        let media = match request.media.filter(|v| !v.is_null()) {
            None => MediaKind::Audio,
            Some(value) => match MediaKind::from_json(&value) {
                Some(media) => media,
                None => {
                    self.registry
                        .send_to(conn, ServerEvent::error("Invalid call type"));
                    return Err(RelayError::InvalidRequest(format!(
                        "invalid callType {value}"
                    )));
                }
            },
        };

        let caller = match self.store.user_profile(caller_id).await? {
            Some(caller) => caller,
            None => {
                self.registry.send_to(conn, ServerEvent::error("User not found"));
                return Err(RelayError::not_found("user", caller_id));
            }
        };

        let _guard = self.locks.lock(&call_id).await;

        if let Err(e) = self
            .create_call(&call_id, &chat_id, caller_id, receiver_id, media)
            .await
        {
            self.registry.send_to(
                conn,
                ServerEvent::CallError {
                    call_id: Some(call_id.clone()),
                    error: "Call could not be created".into(),
                    message: Some(e.to_string()),
                },
            );
            return Err(e);
        }

        let delivered = self.registry.send_to_user(
            receiver_id,
            ServerEvent::CallOffer {
                call_id: call_id.clone(),
                chat_id: chat_id.clone(),
                caller_id,
                caller_name: caller.username.clone(),
                caller_avatar: caller.avatar_url.clone(),
                call_type: media,
                offer,
            },
        );
        let status = if delivered {
            OfferStatus::Sent
        } else {
            OfferStatus::Offline
        };

        self.registry.send_to(
            conn,
            ServerEvent::CallOfferSent {
                call_id: call_id.clone(),
                status,
            },
        );

        let pushed = self
            .push
            .notify_incoming_call(
                receiver_id,
                &call_id,
                &caller.username,
                media,
                caller.avatar_url.as_deref(),
            )
            .await;
        if !pushed {
            warn!(call = %call_id, user = %receiver_id, "Incoming call push not delivered");
        }

        if !delivered {
            self.registry.send_to(
                conn,
                ServerEvent::CallError {
                    call_id: Some(call_id.clone()),
                    error: RECEIVER_OFFLINE.into(),
                    message: None,
                },
            );
        }

        info!(
            call = %call_id,
            caller = %caller_id,
            receiver = %receiver_id,
            media = %media,
            delivered,
            "Call offered"
        );
        Ok(status)
    }

    async fn create_call(
        &self,
        call_id: &str,
        chat_id: &str,
        caller_id: UserId,
        receiver_id: UserId,
        media: MediaKind,
    ) -> Result<(), RelayError> {
        let participants = self
            .store
            .chat_participants(chat_id)
            .await?
            .ok_or_else(|| RelayError::not_found("chat", chat_id))?;

        for user in [caller_id, receiver_id] {
            if !participants.contains(&user) {
                return Err(RelayError::NotParticipant {
                    user,
                    target: format!("chat {chat_id}"),
                });
            }
        }

        let call = Call::new(call_id, chat_id, caller_id, receiver_id, media, Utc::now());
        self.store.insert_call(&call).await.map_err(|e| match e {
            StoreError::NotFound(_) => RelayError::not_found("chat", chat_id),
            other => RelayError::Store(other),
        })
    }

    /// Accept a call. Moves it to `active`, relays the answer to the other
    /// participant and dismisses the answering user's own incoming-call
    /// notification.
    ///
    /// # Errors
    ///
    /// Fails if the call is unknown, the user is not part of it, or it is no
    /// longer pending.
    pub async fn answer(
        &self,
        user: UserId,
        call_id: &str,
        answer: Value,
    ) -> Result<(), RelayError> {
        let _guard = self.locks.lock(call_id).await;
        let mut call = self.load(call_id).await?;
        let target = counterpart(&call, user)?;

        call.answer(Utc::now())?;
        self.store.update_call(&call).await?;

        if !self.push.notify_call_ended(user, call_id).await {
            debug!(call = %call_id, user = %user, "Dismiss push not delivered");
        }

        let delivered = self.registry.send_to_user(
            target,
            ServerEvent::CallAnswer {
                call_id: call_id.to_string(),
                answer,
            },
        );

        info!(call = %call_id, user = %user, delivered, "Call answered");
        Ok(())
    }

    /// Relay an ICE candidate to the other participant. Nothing is persisted
    /// or pushed.
    ///
    /// # Errors
    ///
    /// Fails if the call is unknown or finished, or the user is not part of
    /// it.
    pub async fn ice_candidate(
        &self,
        user: UserId,
        call_id: &str,
        candidate: Value,
    ) -> Result<bool, RelayError> {
        let _guard = self.locks.lock(call_id).await;
        let call = self.load(call_id).await?;
        if call.status.is_terminal() {
            return Err(RelayError::CallFinished {
                call_id: call.id,
                status: call.status,
            });
        }
        let target = counterpart(&call, user)?;

        Ok(self.registry.send_to_user(
            target,
            ServerEvent::CallIceCandidate {
                call_id: call_id.to_string(),
                candidate,
            },
        ))
    }

    /// Hang up a call.
    ///
    /// With a known `actor` the other participant is notified. Without one
    /// (a connection that is not authenticated) both participants are.
    /// Every target gets a `call_ended` event if live and a push regardless.
    ///
    /// Returns the call duration in seconds if it was ever answered.
    ///
    /// # Errors
    ///
    /// Fails if the call is unknown or already finished, or the actor is not
    /// part of it.
    pub async fn end(
        &self,
        actor: Option<UserId>,
        call_id: &str,
        reason: Option<String>,
    ) -> Result<Option<i64>, RelayError> {
        let reason = reason
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_END_REASON.to_string());

        let _guard = self.locks.lock(call_id).await;
        let mut call = self.load(call_id).await?;
        if call.status.is_terminal() {
            return Err(RelayError::CallFinished {
                call_id: call.id,
                status: call.status,
            });
        }

        let targets = match actor {
            Some(actor) => vec![counterpart(&call, actor)?],
            None => vec![call.caller_id, call.receiver_id],
        };

        let duration = call.end(Utc::now(), reason.clone())?;
        self.store.update_call(&call).await?;

        let event = Arc::new(ServerEvent::CallEnded {
            call_id: call_id.to_string(),
            reason: reason.clone(),
            duration,
        });
        for target in targets {
            let delivered = self
                .registry
                .lookup(target)
                .map(|handle| handle.send_shared(Arc::clone(&event)))
                .unwrap_or(false);
            let pushed = self.push.notify_call_ended(target, call_id).await;
            debug!(call = %call_id, user = %target, delivered, pushed, "Call end relayed");
        }

        info!(
            call = %call_id,
            actor = ?actor.map(|user| user.0),
            reason = %reason,
            duration = ?duration,
            "Call ended"
        );
        Ok(duration)
    }

    /// Reject a pending call. The other participant is notified live and by
    /// push: normally the caller, or the receiver when a caller withdraws a
    /// call that is still ringing.
    ///
    /// # Errors
    ///
    /// Fails if the call is unknown, the user is not part of it, or it is no
    /// longer pending.
    pub async fn decline(&self, user: UserId, call_id: &str) -> Result<(), RelayError> {
        let _guard = self.locks.lock(call_id).await;
        let mut call = self.load(call_id).await?;
        if call.status.is_terminal() {
            return Err(RelayError::CallFinished {
                call_id: call.id,
                status: call.status,
            });
        }
        let target = counterpart(&call, user)?;

        call.decline(Utc::now())?;
        self.store.update_call(&call).await?;

        let delivered = self.registry.send_to_user(
            target,
            ServerEvent::CallDeclined {
                call_id: call_id.to_string(),
            },
        );
        let pushed = self.push.notify_call_ended(target, call_id).await;

        info!(call = %call_id, user = %user, target = %target, delivered, pushed, "Call declined");
        Ok(())
    }

    async fn load(&self, call_id: &str) -> Result<Call, RelayError> {
        self.store
            .find_call(call_id)
            .await?
            .ok_or_else(|| RelayError::not_found("call", call_id))
    }
}

fn counterpart(call: &Call, user: UserId) -> Result<UserId, RelayError> {
    call.other_participant(user)
        .ok_or_else(|| RelayError::NotParticipant {
            user,
            target: format!("call {}", call.id),
        })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
