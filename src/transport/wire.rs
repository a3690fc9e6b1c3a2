//! Message formats on the viewer channels.
//!
//! Feed frames are text messages holding `data:image/jpeg;base64,<payload>`,
//! which browsers can assign straight to an `<img>` source. The recognition
//! channel speaks small JSON envelopes: `{"event": "...", "data": ...}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::mjpeg::MAX_JPEG_BYTES;

const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientEvent {
    /// A base64 image, optionally wrapped in a data URI.
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Names recognized in the session's frame; empty when nobody matched.
    Faces(Vec<String>),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image payload is empty")]
    Empty,

    #[error("image payload of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// Render a JPEG as the feed channel's text payload.
pub fn frame_data_uri(jpeg: &[u8]) -> String {
    let mut out = String::with_capacity(JPEG_DATA_URI_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    out.push_str(JPEG_DATA_URI_PREFIX);
    STANDARD.encode_string(jpeg, &mut out);
    out
}

pub fn parse_client_event(text: &str) -> Result<ClientEvent, WireError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, WireError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a `frame` event's image: bare base64 or any `data:<mime>;base64,` URI.
pub fn decode_image(data: &str) -> Result<Bytes, WireError> {
    let encoded = match data.split_once(";base64,") {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => data,
    };
    let encoded = encoded.trim();
    if encoded.len() / 4 * 3 > MAX_JPEG_BYTES + 3 {
        return Err(WireError::TooLarge(encoded.len() / 4 * 3));
    }
    let decoded = STANDARD.decode(encoded)?;
    check_image(decoded.into())
}

/// Accept a raw binary image payload.
pub fn check_image(bytes: Bytes) -> Result<Bytes, WireError> {
    if bytes.is_empty() {
        return Err(WireError::Empty);
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}
