//! Request, response and event envelopes handed to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::codec::{Codec, CodecError, CodecMessage, MessageKind, Payload};
use crate::server::{Result, ServerError};
use crate::transport::Message;

use super::socket::VirtualSocket;

/// An inbound request bound to a virtual socket.
pub struct RpcRequest {
    app: String,
    method: String,
    endpoint: String,
    content_type: String,
    header: HashMap<String, String>,
    body: Bytes,
    first: bool,
    stream: bool,
    socket: Arc<VirtualSocket>,
    codec: Arc<dyn Codec>,
}

impl RpcRequest {
    pub(crate) fn new(
        header: HashMap<String, String>,
        body: Bytes,
        content_type: String,
        stream: bool,
        socket: Arc<VirtualSocket>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        let get = |key: &str| header.get(key).cloned().unwrap_or_default();
        Self {
            app: get("App"),
            method: get("Method"),
            endpoint: get("Endpoint"),
            content_type,
            header,
            body,
            first: true,
            stream,
            socket,
            codec,
        }
    }

    /// Target app name.
    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Headers of the most recently read frame.
    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// The first request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the peer opened a streaming session.
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// Local address label of the underlying connection.
    pub fn local(&self) -> &str {
        self.socket.local()
    }

    /// Remote address label of the underlying connection.
    pub fn remote(&self) -> &str {
        self.socket.remote()
    }

    /// The codec decoding this request's bodies.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Decode the first body through the codec.
    pub fn payload(&self) -> std::result::Result<Payload, CodecError> {
        let mut msg = CodecMessage {
            kind: MessageKind::Request,
            ..CodecMessage::default()
        };
        self.codec.decode(&mut msg, &self.body)
    }

    /// Read the next body: the first frame, then subsequent frames from
    /// the stream.
    pub async fn read(&mut self) -> Result<Bytes> {
        if self.first {
            self.first = false;
            return Ok(self.body.clone());
        }

        let msg = self.socket.recv().await?;
        self.header = msg.header;
        Ok(msg.body)
    }
}

/// The write side of a request, sending through the codec onto the
/// stream's outbound channel.
pub struct RpcResponse {
    header: Mutex<HashMap<String, String>>,
    request_header: HashMap<String, String>,
    stream_id: Option<String>,
    socket: Arc<VirtualSocket>,
    codec: Arc<dyn Codec>,
}

impl RpcResponse {
    pub(crate) fn new(
        request_header: HashMap<String, String>,
        stream_id: Option<String>,
        socket: Arc<VirtualSocket>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            header: Mutex::new(HashMap::new()),
            request_header,
            stream_id,
            socket,
            codec,
        }
    }

    /// Set a response header.
    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.header
            .lock()
            .expect("response header lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Write a response payload.
    pub async fn write(&self, payload: Payload) -> Result<()> {
        let msg = CodecMessage {
            kind: MessageKind::Response,
            ..CodecMessage::default()
        };
        self.write_message(msg, payload).await
    }

    /// Write a fully specified message through the codec.
    pub async fn write_message(&self, mut msg: CodecMessage, payload: Payload) -> Result<()> {
        // Responses carry the original request headers, overlaid with
        // anything the handler set.
        let mut header = self.request_header.clone();
        header.extend(
            self.header
                .lock()
                .expect("response header lock poisoned")
                .clone(),
        );
        header.extend(msg.header.drain());

        if msg.id.is_empty() {
            if let Some(id) = self.request_header.get("Id") {
                msg.id = id.clone();
            }
        }

        let set = |header: &mut HashMap<String, String>, key: &str, value: &str| {
            if !value.is_empty() {
                header.insert(key.to_string(), value.to_string());
            }
        };
        set(&mut header, "Id", &msg.id);
        set(&mut header, "App", &msg.target);
        set(&mut header, "Method", &msg.method);
        set(&mut header, "Endpoint", &msg.endpoint);
        set(&mut header, "Error", &msg.error);
        if matches!(msg.kind, MessageKind::Error) {
            set(&mut header, "Type", "Error");
        }
        if let Some(stream_id) = &self.stream_id {
            set(&mut header, "Stream", stream_id);
        }

        let body = self.codec.encode(&msg, &payload)?;
        self.socket.send(Message { header, body }).await
    }

    /// Write an error message, preserving the request headers.
    pub(crate) async fn write_error(&self, error: &ServerError) -> Result<()> {
        let msg = CodecMessage {
            kind: MessageKind::Error,
            error: error.to_string(),
            ..CodecMessage::default()
        };
        self.write_message(msg, Payload::Json(serde_json::Value::Null))
            .await
    }
}

/// An inbound event message.
pub struct EventMessage {
    topic: String,
    content_type: String,
    header: HashMap<String, String>,
    body: Bytes,
    codec: Arc<dyn Codec>,
}

impl EventMessage {
    pub(crate) fn new(
        topic: String,
        content_type: String,
        header: HashMap<String, String>,
        body: Bytes,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            topic,
            content_type,
            header,
            body,
            codec,
        }
    }

    /// The event topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// The raw event body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the body through the codec.
    pub fn payload(&self) -> std::result::Result<Payload, CodecError> {
        let mut msg = CodecMessage {
            kind: MessageKind::Event,
            ..CodecMessage::default()
        };
        self.codec.decode(&mut msg, &self.body)
    }
}
