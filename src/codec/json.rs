//! Plain JSON codec.

use bytes::Bytes;

use super::{Codec, CodecError, CodecMessage, Payload, Result};

/// Codec for `application/json`: the body is the payload, unframed.
#[derive(Debug)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, _msg: &CodecMessage, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode(e.to_string())),
            // Raw frames pass through untouched.
            Payload::Raw(bytes) => Ok(bytes.clone()),
        }
    }

    fn decode(&self, _msg: &mut CodecMessage, body: &[u8]) -> Result<Payload> {
        if body.is_empty() {
            return Ok(Payload::Json(serde_json::Value::Null));
        }
        serde_json::from_slice(body)
            .map(Payload::Json)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let payload = Payload::Json(json!({"name": "weft", "port": 8080}));

        let body = codec.encode(&CodecMessage::default(), &payload).unwrap();
        let decoded = codec
            .decode(&mut CodecMessage::default(), &body)
            .unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_json_empty_body_is_null() {
        let codec = JsonCodec;
        let decoded = codec.decode(&mut CodecMessage::default(), b"").unwrap();
        assert_eq!(decoded, Payload::Json(serde_json::Value::Null));
    }

    #[test]
    fn test_json_invalid_body_errors() {
        let codec = JsonCodec;
        assert!(codec
            .decode(&mut CodecMessage::default(), b"{not json")
            .is_err());
    }

    #[test]
    fn test_json_raw_passthrough() {
        let codec = JsonCodec;
        let payload = Payload::Raw(Bytes::from_static(b"ping"));
        let body = codec.encode(&CodecMessage::default(), &payload).unwrap();
        assert_eq!(&body[..], b"ping");
    }
}
