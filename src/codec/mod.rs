//! Content-type codecs for request, response and event bodies.
//!
//! Codecs translate between wire bodies and [`Payload`] values. Three
//! content types are recognized: plain JSON, the legacy JSON-RPC framing
//! and raw pass-through bytes. Selection happens per message via
//! [`codec_for`]; [`setup_protocol`] implements the legacy shim for
//! peers that predate the `Protocol` header.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

pub mod json;
pub mod json_rpc;
pub mod raw;

pub use json::JsonCodec;
pub use json_rpc::JsonRpcCodec;
pub use raw::RawCodec;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_JSON_RPC: &str = "application/json-rpc";
pub const CONTENT_TYPE_RAW: &str = "application/octet-stream";

/// Content type assumed when a message carries none.
pub const DEFAULT_CONTENT_TYPE: &str = CONTENT_TYPE_JSON;

/// Header carrying the peer protocol hint. Requests without it and with
/// a JSON content type are served by the legacy codec map.
pub const PROTOCOL_HEADER: &str = "Protocol";

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur during encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported Content-Type: {0}")]
    Unsupported(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// The kind of message a codec is framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Request,
    Response,
    Error,
    Event,
}

/// Routing metadata carried alongside a payload.
#[derive(Debug, Clone, Default)]
pub struct CodecMessage {
    pub id: String,
    pub kind: MessageKind,
    /// Target app name.
    pub target: String,
    pub method: String,
    pub endpoint: String,
    pub error: String,
    pub header: HashMap<String, String>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Raw(Bytes),
}

impl Payload {
    /// Serialize any value into a JSON payload.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize a JSON payload into a value. Raw payloads are parsed
    /// as JSON bytes.
    pub fn to_value<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| CodecError::Decode(e.to_string())),
            Payload::Raw(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

/// Interface for content-type codecs.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Name of the implementation.
    fn name(&self) -> &'static str;

    /// Encode a payload into a wire body.
    fn encode(&self, msg: &CodecMessage, payload: &Payload) -> Result<Bytes>;

    /// Decode a wire body, filling any routing metadata the framing
    /// carries into `msg`.
    fn decode(&self, msg: &mut CodecMessage, body: &[u8]) -> Result<Payload>;
}

/// Look up the codec for a content type.
pub fn codec_for(content_type: &str) -> Result<Arc<dyn Codec>> {
    match content_type {
        CONTENT_TYPE_JSON => Ok(Arc::new(JsonCodec)),
        CONTENT_TYPE_JSON_RPC => Ok(Arc::new(JsonRpcCodec)),
        CONTENT_TYPE_RAW => Ok(Arc::new(RawCodec)),
        other => Err(CodecError::Unsupported(other.to_string())),
    }
}

/// Legacy codec map used for peers without a protocol hint.
fn legacy_codec_for(content_type: &str) -> Option<Arc<dyn Codec>> {
    match content_type {
        CONTENT_TYPE_JSON | CONTENT_TYPE_JSON_RPC => Some(Arc::new(JsonRpcCodec)),
        _ => None,
    }
}

/// Legacy protocol shim.
///
/// A request from a peer that sends no `Protocol` hint and a plain JSON
/// content type is rewritten to the JSON-RPC content type and served by
/// the legacy codec map. Event messages are exempt. Returns the
/// rewritten content type and codec, or `None` when the main codec map
/// applies.
pub fn setup_protocol(header: &HashMap<String, String>) -> Option<(String, Arc<dyn Codec>)> {
    if header
        .get(PROTOCOL_HEADER)
        .is_some_and(|p| !p.is_empty())
    {
        return None;
    }

    if header.get("Event").is_some_and(|e| !e.is_empty()) {
        return None;
    }

    let content_type = header
        .get("Content-Type")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let rewritten = match content_type {
        CONTENT_TYPE_JSON => CONTENT_TYPE_JSON_RPC,
        other => other,
    };

    legacy_codec_for(rewritten).map(|codec| (rewritten.to_string(), codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_for_known_types() {
        assert_eq!(codec_for(CONTENT_TYPE_JSON).unwrap().name(), "json");
        assert_eq!(
            codec_for(CONTENT_TYPE_JSON_RPC).unwrap().name(),
            "json-rpc"
        );
        assert_eq!(codec_for(CONTENT_TYPE_RAW).unwrap().name(), "raw");
    }

    #[test]
    fn test_codec_for_unknown_type() {
        let err = codec_for("text/unknown").unwrap_err();
        assert!(err.to_string().contains("Unsupported Content-Type"));
    }

    #[test]
    fn test_setup_protocol_rewrites_plain_json() {
        let mut header = HashMap::new();
        header.insert("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string());

        let (content_type, codec) = setup_protocol(&header).unwrap();
        assert_eq!(content_type, CONTENT_TYPE_JSON_RPC);
        assert_eq!(codec.name(), "json-rpc");
    }

    #[test]
    fn test_setup_protocol_skips_hinted_peers() {
        let mut header = HashMap::new();
        header.insert("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string());
        header.insert(PROTOCOL_HEADER.to_string(), "rpc".to_string());

        assert!(setup_protocol(&header).is_none());
    }

    #[test]
    fn test_setup_protocol_skips_events() {
        let mut header = HashMap::new();
        header.insert("Event".to_string(), "user.created".to_string());

        assert!(setup_protocol(&header).is_none());
    }

    #[test]
    fn test_setup_protocol_ignores_raw() {
        let mut header = HashMap::new();
        header.insert("Content-Type".to_string(), CONTENT_TYPE_RAW.to_string());

        assert!(setup_protocol(&header).is_none());
    }
}
