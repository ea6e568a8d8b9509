//! # parley-protocol
//!
//! Wire protocol definitions for the Parley signaling relay.
//!
//! This crate defines the events exchanged between Parley clients and the
//! relay, and the codec that turns them into WebSocket frames.
//!
//! ## Event Kinds
//!
//! - `auth` / `ping` - Session setup and liveness
//! - `typing` / `send_message` / `mark_read` - Chat traffic
//! - `call_offer` / `call_answer` / `call_ice_candidate` / `call_end` /
//!   `call_decline` - Call signaling
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent, EventKind};
//!
//! let event = codec::decode_text(r#"{"type":"ping"}"#).unwrap();
//! assert_eq!(event.kind(), EventKind::Ping);
//!
//! let frame = codec::encode_binary(&ClientEvent::ping()).unwrap();
//! assert_eq!(codec::decode_binary(&frame).unwrap(), event);
//! ```

pub mod codec;
pub mod events;
pub mod ids;

pub use codec::{decode_binary, decode_text, encode, Encoding, ProtocolError, WireFrame};
pub use events::{ChatMessage, ClientEvent, EventKind, MediaKind, OfferStatus, ServerEvent};
pub use ids::{MessageId, UserId};
