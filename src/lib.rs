//! Weft - Distributed Application Framework
//!
//! A framework core for building distributed applications: independent
//! processes discover one another through a registry, invoke functions
//! across a multiplexed message transport, and publish/subscribe to
//! events through a broker.

pub mod broker;
pub mod cache;
pub mod codec;
pub mod config;
pub mod registry;
pub mod selector;
pub mod server;
pub mod transport;
pub mod utils;

// Re-export common types for library usage
pub use broker::{Broker, BrokerMessage};
pub use codec::{Codec, CodecMessage, Payload};
pub use config::Config;
pub use registry::{App, Endpoint, Event, EventKind, Instance, Registry, Watcher};
pub use server::rpc::RpcServer;
pub use server::{Context, Handler, Router, ServerOptions, Subscriber};
pub use transport::{Message, Socket, Transport};
