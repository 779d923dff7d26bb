//! Raw frame codec: bodies pass through untouched.

use bytes::Bytes;

use super::{Codec, CodecError, CodecMessage, Payload, Result};

/// Codec for `application/octet-stream`.
#[derive(Debug)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, _msg: &CodecMessage, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode(e.to_string())),
        }
    }

    fn decode(&self, _msg: &mut CodecMessage, body: &[u8]) -> Result<Payload> {
        Ok(Payload::Raw(Bytes::copy_from_slice(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_passthrough() {
        let codec = RawCodec;
        let payload = Payload::Raw(Bytes::from_static(b"\x00\x01binary"));

        let body = codec.encode(&CodecMessage::default(), &payload).unwrap();
        assert_eq!(&body[..], b"\x00\x01binary");

        let decoded = codec.decode(&mut CodecMessage::default(), &body).unwrap();
        assert_eq!(decoded, payload);
    }
}
