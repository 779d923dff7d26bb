//! Legacy JSON-RPC codec.
//!
//! Frames requests as `{"id","method","params"}` and responses as
//! `{"id","result","error"}`, for peers that predate the plain JSON
//! protocol.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Codec, CodecError, CodecMessage, MessageKind, Payload, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    #[serde(default)]
    id: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Codec for `application/json-rpc`.
#[derive(Debug)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    fn payload_value(payload: &Payload) -> Result<Value> {
        match payload {
            Payload::Json(value) => Ok(value.clone()),
            Payload::Raw(bytes) if bytes.is_empty() => Ok(Value::Null),
            Payload::Raw(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }
}

impl Codec for JsonRpcCodec {
    fn name(&self) -> &'static str {
        "json-rpc"
    }

    fn encode(&self, msg: &CodecMessage, payload: &Payload) -> Result<Bytes> {
        let body = match msg.kind {
            MessageKind::Request | MessageKind::Event => serde_json::to_vec(&Request {
                id: msg.id.clone(),
                method: if msg.method.is_empty() {
                    msg.endpoint.clone()
                } else {
                    msg.method.clone()
                },
                params: Self::payload_value(payload)?,
            }),
            MessageKind::Response => serde_json::to_vec(&Response {
                id: msg.id.clone(),
                result: Self::payload_value(payload)?,
                error: None,
            }),
            MessageKind::Error => serde_json::to_vec(&Response {
                id: msg.id.clone(),
                result: Value::Null,
                error: Some(msg.error.clone()),
            }),
        };

        body.map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, msg: &mut CodecMessage, body: &[u8]) -> Result<Payload> {
        if body.is_empty() {
            return Ok(Payload::Json(Value::Null));
        }

        match msg.kind {
            MessageKind::Request | MessageKind::Event => {
                let request: Request = serde_json::from_slice(body)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                if msg.id.is_empty() {
                    msg.id = request.id;
                }
                if msg.method.is_empty() {
                    msg.method = request.method;
                }
                Ok(Payload::Json(request.params))
            }
            MessageKind::Response | MessageKind::Error => {
                let response: Response = serde_json::from_slice(body)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                if msg.id.is_empty() {
                    msg.id = response.id;
                }
                if let Some(error) = response.error {
                    msg.error = error;
                }
                Ok(Payload::Json(response.result))
            }
        }
    }
}
