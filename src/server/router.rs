//! Default request/event router.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    Context, EventMessage, Handler, Result, Router, RpcRequest, RpcResponse, ServerError,
    Subscriber,
};

/// Routes requests to named handlers and event messages to topic
/// subscribers.
///
/// A request's dispatch key is its `Endpoint` header (falling back to
/// `Method`); the handler name is the part before the first `.`, e.g.
/// `Greeter.Hello` routes to the handler named `Greeter`.
#[derive(Default)]
pub struct RpcRouter {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its name.
    pub async fn register_handler(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        debug!(handler = %name, "Registered handler");
        self.handlers.write().await.insert(name, handler);
    }

    /// Register a subscriber under its topic.
    pub async fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        let topic = subscriber.topic().to_string();
        debug!(topic = %topic, "Registered subscriber");
        self.subscribers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(subscriber);
    }
}

#[async_trait]
impl Router for RpcRouter {
    async fn serve_request(
        &self,
        ctx: Context,
        req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<()> {
        let endpoint = if req.endpoint().is_empty() {
            req.method().to_string()
        } else {
            req.endpoint().to_string()
        };
        let name = endpoint
            .split_once('.')
            .map(|(name, _)| name)
            .unwrap_or(endpoint.as_str());

        let handler = self
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownEndpoint(endpoint.clone()))?;

        handler.serve(ctx, req, rsp).await
    }

    async fn process_message(&self, ctx: Context, msg: &EventMessage) -> Result<()> {
        let subscribers = self
            .subscribers
            .read()
            .await
            .get(msg.topic())
            .cloned()
            .unwrap_or_default();

        if subscribers.is_empty() {
            return Err(ServerError::UnknownEndpoint(msg.topic().to_string()));
        }

        for subscriber in subscribers {
            subscriber.process(ctx.clone(), msg).await?;
        }
        Ok(())
    }
}
