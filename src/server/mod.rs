//! RPC server: handler contracts, request envelopes and the server
//! implementation.
//!
//! This module contains:
//! - [`Handler`] / [`Subscriber`] / [`Router`] traits: the dispatch surface
//! - [`Context`]: request-scoped metadata and deadline
//! - [`ServerOptions`]: collaborator wiring and registration settings
//! - The RPC server in [`rpc`]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, MemoryBroker};
use crate::codec::CodecError;
use crate::config::ServerConfig;
use crate::registry::{Endpoint, Registry, RegistryError, DEFAULT_DOMAIN};
use crate::transport::{MemoryTransport, Transport, TransportError};
use crate::utils::addr::AddrError;

pub mod router;
pub mod rpc;

pub use router::RpcRouter;
pub use rpc::request::{EventMessage, RpcRequest, RpcResponse};
pub use rpc::RpcServer;

/// End-of-stream sentinel carried in the `Error` header.
pub const EOS: &str = "EOS";

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// No more messages will follow on this stream. The display form is
    /// the wire sentinel [`EOS`].
    #[error("EOS")]
    EndOfStream,

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection is shut down")]
    Shutdown,

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Addr(#[from] AddrError),
}

/// Request-scoped metadata and cooperative deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    metadata: HashMap<String, String>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new(metadata: HashMap<String, String>) -> Self {
        Self {
            metadata,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Look up a metadata value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// The deadline bound from the request `Timeout` header, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has passed. Handlers doing long work should
    /// check this cooperatively.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// A registered request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name; requests route on the part of the endpoint before
    /// the first `.`.
    fn name(&self) -> &str;

    /// Endpoints advertised in the registry.
    fn endpoints(&self) -> Vec<Endpoint> {
        Vec::new()
    }

    /// Internal handlers are not advertised.
    fn internal(&self) -> bool {
        false
    }

    /// Serve one request, writing responses through `rsp`.
    async fn serve(&self, ctx: Context, req: &mut RpcRequest, rsp: &RpcResponse) -> Result<()>;
}

/// A registered event subscriber.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// The event topic this subscriber consumes.
    fn topic(&self) -> &str;

    /// Endpoints advertised in the registry.
    fn endpoints(&self) -> Vec<Endpoint> {
        Vec::new()
    }

    /// Internal subscribers are not advertised.
    fn internal(&self) -> bool {
        false
    }

    /// Queue group for shared consumption, if any.
    fn queue(&self) -> Option<&str> {
        None
    }

    /// Process one event message.
    async fn process(&self, ctx: Context, msg: &EventMessage) -> Result<()>;
}

/// The dispatch capability set.
///
/// The default [`RpcRouter`] implements both capabilities over named
/// handlers and subscribers; [`ServerOptions::router`] swaps in a custom
/// implementation.
#[async_trait]
pub trait Router: Send + Sync {
    /// Route a request to a handler.
    async fn serve_request(
        &self,
        ctx: Context,
        req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<()>;

    /// Route an event message to its subscribers.
    async fn process_message(&self, ctx: Context, msg: &EventMessage) -> Result<()>;
}

/// Health check gating registration.
pub type RegisterCheck = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn default_register_check() -> RegisterCheck {
    Arc::new(|| Box::pin(async { Ok(()) }))
}

/// Server configuration and collaborator wiring.
#[derive(Clone)]
pub struct ServerOptions {
    /// Advertised app name.
    pub name: String,
    /// Unique server id.
    pub id: String,
    /// Advertised app version.
    pub version: String,
    /// Bind address. Swapped for the concretely bound address on start.
    pub address: String,
    /// Advertised address override.
    pub advertise: Option<String>,
    /// Registration domain.
    pub namespace: String,
    /// Extra instance metadata.
    pub metadata: HashMap<String, String>,
    /// Registration TTL. Zero disables expiry.
    pub register_ttl: Duration,
    /// Heartbeat interval. Zero disables the heartbeat loop.
    pub register_interval: Duration,
    /// Registry collaborator. `None` (or a "noop" registry) disables
    /// registration entirely.
    pub registry: Option<Arc<dyn Registry>>,
    /// Broker collaborator.
    pub broker: Arc<dyn Broker>,
    /// Transport collaborator.
    pub transport: Arc<dyn Transport>,
    /// Health check run before each registration.
    pub register_check: RegisterCheck,
    /// Router override. `None` uses the server's own [`RpcRouter`].
    pub router: Option<Arc<dyn Router>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "weft.server".to_string(),
            id: Uuid::new_v4().to_string(),
            version: "latest".to_string(),
            address: "127.0.0.1:0".to_string(),
            advertise: None,
            namespace: DEFAULT_DOMAIN.to_string(),
            metadata: HashMap::new(),
            register_ttl: Duration::from_secs(90),
            register_interval: Duration::from_secs(30),
            registry: None,
            broker: Arc::new(MemoryBroker::new()),
            transport: Arc::new(MemoryTransport::new()),
            register_check: default_register_check(),
            router: None,
        }
    }
}

impl ServerOptions {
    /// Build options from loaded configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut opts = Self {
            name: config.name.clone(),
            version: config.version.clone(),
            address: config.address.clone(),
            advertise: config.advertise.clone(),
            namespace: config.namespace.clone(),
            metadata: config.metadata.clone(),
            register_ttl: Duration::from_secs(config.register_ttl_secs),
            register_interval: Duration::from_secs(config.register_interval_secs),
            ..Self::default()
        };
        if !config.id.is_empty() {
            opts.id = config.id.clone();
        }
        opts
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_register_check(mut self, check: RegisterCheck) -> Self {
        self.register_check = check;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }
}
