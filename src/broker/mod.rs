//! Event broker abstraction for publish/subscribe messaging.
//!
//! This module contains:
//! - The [`Broker`] trait: connect/publish/subscribe contract
//! - The [`EventHandler`] trait invoked per delivered message
//! - The in-memory implementation in [`memory`]

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;

pub use memory::MemoryBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

/// A published event: header map and opaque body.
#[derive(Debug, Clone, Default)]
pub struct BrokerMessage {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl BrokerMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// Handler invoked for each message delivered to a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, msg: BrokerMessage) -> Result<()>;
}

/// A live subscription returned by [`Broker::subscribe`].
#[async_trait]
pub trait Subscription: Send + Sync {
    /// The subscribed topic.
    fn topic(&self) -> &str;

    /// Stop delivery to this subscription.
    async fn unsubscribe(&self);
}

/// Options for [`Broker::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group: members share a queue, each message going to one of
    /// them. `None` delivers every message to this subscriber.
    pub queue: Option<String>,
}

impl SubscribeOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// Interface for event brokers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect to the broker.
    async fn connect(&self) -> Result<()>;

    /// Disconnect from the broker.
    async fn disconnect(&self) -> Result<()>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, msg: &BrokerMessage) -> Result<()>;

    /// Subscribe a handler to a topic.
    async fn subscribe(
        &self,
        topic: &str,
        handler: std::sync::Arc<dyn EventHandler>,
        opts: SubscribeOptions,
    ) -> Result<std::sync::Arc<dyn Subscription>>;

    /// Broker address.
    fn address(&self) -> String;

    /// Name of the implementation.
    fn name(&self) -> &'static str;
}
