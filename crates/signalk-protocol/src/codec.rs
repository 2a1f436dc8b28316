//! Frame codec for SignalK streams.
//!
//! SignalK uses JSON messages over WebSocket text frames and newline
//! delimited JSON over TCP. This module decodes a single frame into a
//! [`ServerMessage`] and encodes messages for transmission.

use crate::messages::{HelloMessage, ServerMessage};
use serde_json::Value;
use signalk_core::Delta;
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame bytes are not UTF-8 text.
    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The frame is JSON but not an object.
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Message type could not be determined.
    #[error("Unknown message type")]
    UnknownMessage,
}

/// Encode a server message to JSON string for transmission.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode one text frame.
///
/// A frame with `updates` is a delta; a frame with `version` and `self` or
/// `roles` is a hello. Anything else is rejected rather than read as an
/// empty delta.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let fields = match &value {
        Value::Object(fields) => fields,
        Value::Array(_) => return Err(CodecError::NotAnObject("an array")),
        Value::String(_) => return Err(CodecError::NotAnObject("a string")),
        Value::Number(_) => return Err(CodecError::NotAnObject("a number")),
        Value::Bool(_) => return Err(CodecError::NotAnObject("a boolean")),
        Value::Null => return Err(CodecError::NotAnObject("null")),
    };

    if fields.contains_key("updates") {
        let delta: Delta = serde_json::from_value(value)?;
        return Ok(ServerMessage::Delta(delta));
    }
    if fields.contains_key("version") && (fields.contains_key("self") || fields.contains_key("roles")) {
        let hello: HelloMessage = serde_json::from_value(value)?;
        return Ok(ServerMessage::Hello(hello));
    }
    Err(CodecError::UnknownMessage)
}

/// Decode one frame given as raw bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<ServerMessage, CodecError> {
    let text = std::str::from_utf8(bytes)?;
    decode_server_message(text.trim())
}

/// Decode a frame that must be a delta.
///
/// Hello messages decode to `Ok(None)`.
pub fn decode_delta(bytes: &[u8]) -> Result<Option<Delta>, CodecError> {
    match decode_frame(bytes)? {
        ServerMessage::Delta(delta) => Ok(Some(delta)),
        ServerMessage::Hello(_) => Ok(None),
    }
}
