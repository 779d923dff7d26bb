//! Message transport abstraction.
//!
//! A transport moves framed messages (header map + opaque body) between
//! processes. The server consumes the [`Transport`] / [`Listener`] /
//! [`Socket`] contracts only; the in-memory implementation in [`memory`]
//! backs tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;

pub use memory::MemoryTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("address already in use: {0}")]
    AddrInUse(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A framed wire message: a header map and an opaque body.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    /// Create a message with the given body and an empty header.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header field.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// One end of an established connection.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send a message to the peer.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Receive the next message from the peer.
    async fn recv(&self) -> Result<Message>;

    /// Local address label.
    fn local(&self) -> String;

    /// Remote address label.
    fn remote(&self) -> String;

    /// Close the connection. The peer observes [`TransportError::Closed`].
    async fn close(&self);
}

/// A bound listener producing sockets for inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The concrete bound address.
    fn addr(&self) -> String;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Arc<dyn Socket>>;

    /// Close the listener and refuse further dials.
    async fn close(&self);
}

/// Interface for message transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener. `:0` style addresses pick a free port.
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>>;

    /// Connect to a listener.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Socket>>;

    /// Name of the implementation.
    fn name(&self) -> &'static str;
}
