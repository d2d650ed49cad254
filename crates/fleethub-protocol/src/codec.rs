//! Codecs for encoding and decoding FleetHub events.
//!
//! Text frames carry the event envelope as JSON. Binary frames carry the same
//! envelope as MessagePack with length-prefixed framing, so several events can
//! share one transport message and one event can span several.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

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

    /// Unsupported wire format name.
    #[error("Unknown wire format: {0}")]
    UnknownFormat(String),
}

/// Encoding used for events sent to a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON in WebSocket text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack in WebSocket binary frames.
    MessagePack,
}

impl WireFormat {
    /// Encode an event in this format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the frame is too large.
    pub fn encode<T: Serialize>(self, event: &T) -> Result<Encoded, ProtocolError> {
        match self {
            WireFormat::Json => encode_json(event).map(Encoded::Text),
            WireFormat::MessagePack => encode(event).map(Encoded::Binary),
        }
    }
}

impl FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" | "messagepack" => Ok(WireFormat::MessagePack),
            other => Err(ProtocolError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::MessagePack => f.write_str("msgpack"),
        }
    }
}

/// An encoded event, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Goes out as a text frame.
    Text(String),
    /// Goes out as a binary frame.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the encoded payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode an event as a JSON envelope.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a JSON envelope.
///
/// # Errors
///
/// Returns an error if the text is not a well-formed envelope.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode an event to a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
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

/// Decode a single length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
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

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if a whole frame is present.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// A frame whose body fails to decode is still consumed, so the caller can
/// keep reading after logging the error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
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

    Ok(Some(rmp_serde::from_slice(&payload)?))
}
