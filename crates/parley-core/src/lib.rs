//! # parley-core
//!
//! Connection registry, call signaling and message relay for the Parley
//! signaling relay.
//!
//! This crate provides the building blocks the server wires together:
//!
//! - **Registry** - Live connections and the single session per user
//! - **Auth** - Token resolution and session promotion
//! - **Router** - Per-frame dispatch with the unauthenticated gate
//! - **Presence** - Online/offline broadcasts and typing indicators
//! - **Calls** - The call signaling state machine
//! - **Locks** - Per-key async locks for calls and presence
//! - **Messages** - Persist-then-relay chat messages and read receipts
//! - **Store** / **Push** / **Identity** - External collaborator interfaces
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Calls      │──┐
//! └─────────────┘     └─────────────┘     │  Messages   │  │
//!        ▲                   │            │  Presence   │  │
//!        │                   ▼            └─────────────┘  │
//!        │            ┌─────────────┐            │         ▼
//!        └────────────│  Registry   │◀───────────┘   Store / Push
//!                     └─────────────┘
//! ```

pub mod auth;
pub mod calls;
pub mod connection;
pub mod error;
pub mod identity;
pub mod locks;
pub mod messages;
pub mod model;
pub mod presence;
pub mod push;
pub mod registry;
pub mod router;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use auth::AuthGate;
pub use calls::{CallLocks, CallSignaling, OfferRequest};
pub use connection::{ConnectionHandle, ConnectionId, Outgoing, UserIdentity};
pub use error::RelayError;
pub use identity::{normalize_token, AuthError, IdentityResolver, MemoryIdentityResolver};
pub use locks::{KeyGuard, KeyedLocks};
pub use messages::MessageRelay;
pub use model::{Call, CallStatus, NewMessage, StoredMessage, TransitionError, UserProfile};
pub use presence::PresenceBroadcaster;
pub use push::{LoggingPushGateway, PushGateway, PushNotification};
pub use registry::{ConnectionRegistry, ConnectionState, Detached, RegistryError, RegistryStats};
pub use router::{Dispatch, Router};
pub use store::{MemoryStore, Store, StoreError};
