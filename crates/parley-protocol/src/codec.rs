//! Codec for encoding and decoding Parley events.
//!
//! Two frame encodings are supported:
//! - **Text**: one JSON object per WebSocket text message.
//! - **Binary**: a 4-byte big-endian length prefix followed by a
//!   MessagePack-encoded map with the same shape as the JSON form.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::events::{ClientEvent, EventKind};

/// Maximum binary frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is not a well-formed event.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The payload is well-formed but its kind is not known to this relay.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),
}

impl ProtocolError {
    /// Whether the error came from an event kind this relay does not handle,
    /// as opposed to a broken payload.
    #[must_use]
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, ProtocolError::UnknownKind(_))
    }
}

/// Frame encoding used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Text,
    Binary,
}

/// An encoded frame ready to be written to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }
}

/// Encode an event with the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode<T: Serialize>(event: &T, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    match encoding {
        Encoding::Text => encode_text(event).map(WireFrame::Text),
        Encoding::Binary => encode_binary(event).map(WireFrame::Binary),
    }
}

/// Encode an event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_text<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Encode an event as a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(event: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a client event from a JSON text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownKind`] for an unrecognized `type` and
/// [`ProtocolError::Malformed`] for anything that is not a valid event.
pub fn decode_text(text: &str) -> Result<ClientEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode a client event from a complete length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or not an event.
pub fn decode_binary(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let value: Value = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    decode_value(value)
}

/// Try to decode an event from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. A frame
/// that fails to decode is still consumed from the buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<ClientEvent>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let value: Value = rmp_serde::from_slice(&payload)?;

    decode_value(value).map(Some)
}

/// Decode a client event from an already-parsed JSON value.
///
/// # Errors
///
/// Returns an error if the value has no `type`, an unknown `type`, or
/// fields that do not match the event.
pub fn decode_value(value: Value) -> Result<ClientEvent, ProtocolError> {
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(ProtocolError::Malformed("`type` is not a string".into())),
        None if value.is_object() => {
            return Err(ProtocolError::Malformed("missing `type`".into()))
        }
        None => return Err(ProtocolError::Malformed("event is not an object".into())),
    };

    if EventKind::parse(&kind).is_none() {
        return Err(ProtocolError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
