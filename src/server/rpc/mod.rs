//! The RPC server: accept loop, registration heartbeat and graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{error, info, warn};

use crate::broker::{
    self, BrokerMessage, SubscribeOptions, Subscription,
};
use crate::registry::{AddOptions, App, Instance, Registry, RemoveOptions};
use crate::server::{Handler, Result, Router, RpcRouter, ServerError, ServerOptions, Subscriber};
use crate::transport::TransportError;
use crate::utils::addr;
use crate::utils::wait::WaitGroup;

mod connection;
pub mod request;
mod socket;

/// Registration attempts before surfacing the last error.
const REGISTER_ATTEMPTS: usize = 3;

/// Sleep before retrying a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

struct SubscriberEntry {
    subscriber: Arc<dyn Subscriber>,
    subscriptions: Vec<Arc<dyn Subscription>>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    registered: bool,
    /// Registration cached when the advertised host is an IP literal.
    cached_app: Option<App>,
    self_subscription: Option<Arc<dyn Subscription>>,
    exit_tx: Option<mpsc::Sender<oneshot::Sender<Result<()>>>>,
}

struct ServerInner {
    opts: RwLock<ServerOptions>,
    router: Arc<RpcRouter>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    lifecycle: RwLock<Lifecycle>,
    wg: Arc<WaitGroup>,
}

/// RPC server over a message transport.
///
/// Accepted sockets are demultiplexed into logical streams and routed to
/// registered handlers; the server periodically re-registers itself with
/// the registry and drains in-flight work on stop.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                opts: RwLock::new(opts),
                router: Arc::new(RpcRouter::new()),
                handlers: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                lifecycle: RwLock::new(Lifecycle::default()),
                wg: WaitGroup::new(),
            }),
        }
    }

    /// Name of the implementation.
    pub fn name(&self) -> &'static str {
        "rpc"
    }

    /// A snapshot of the current options.
    pub async fn options(&self) -> ServerOptions {
        self.inner.opts.read().await.clone()
    }

    /// Register a request handler.
    pub async fn handle(&self, handler: Arc<dyn Handler>) {
        self.inner.router.register_handler(Arc::clone(&handler)).await;
        self.inner
            .handlers
            .write()
            .await
            .insert(handler.name().to_string(), handler);
    }

    /// Register an event subscriber.
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner
            .router
            .register_subscriber(Arc::clone(&subscriber))
            .await;
        self.inner.subscribers.write().await.push(SubscriberEntry {
            subscriber,
            subscriptions: Vec::new(),
        });
    }

    async fn effective_router(&self) -> Arc<dyn Router> {
        let opts = self.inner.opts.read().await;
        match &opts.router {
            Some(router) => Arc::clone(router),
            None => Arc::clone(&self.inner.router) as Arc<dyn Router>,
        }
    }

    /// Start listening, connect the broker, register and spawn the
    /// accept and heartbeat loops.
    pub async fn start(&self) -> Result<()> {
        if self.inner.lifecycle.read().await.started {
            return Ok(());
        }

        let opts = self.options().await;

        let listener = opts.transport.listen(&opts.address).await?;
        info!(
            transport = %opts.transport.name(),
            address = %listener.addr(),
            "Transport listening"
        );

        // Swap in the concretely bound address; restored on stop.
        let original_address = {
            let mut o = self.inner.opts.write().await;
            std::mem::replace(&mut o.address, listener.addr())
        };

        opts.broker.connect().await?;
        info!(
            broker = %opts.broker.name(),
            address = %opts.broker.address(),
            "Broker connected"
        );

        // Health-gated first registration.
        match (opts.register_check)().await {
            Ok(()) => {
                if let Err(e) = self.register().await {
                    error!(app = %opts.name, id = %opts.id, error = %e, "Server register error");
                }
            }
            Err(e) => {
                error!(app = %opts.name, id = %opts.id, error = %e, "Server register check error");
            }
        }

        let (exit_tx, mut exit_rx) = mpsc::channel::<oneshot::Sender<Result<()>>>(1);
        let (accept_exit_tx, mut accept_exit_rx) = watch::channel(false);

        // Accept loop: serve connections until exit, riding out accept
        // errors with a delay.
        {
            let listener = Arc::clone(&listener);
            let router = self.effective_router().await;
            let wg = Arc::clone(&self.inner.wg);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = accept_exit_rx.changed() => return,
                        accepted = listener.accept() => match accepted {
                            Ok(sock) => {
                                let router = Arc::clone(&router);
                                let wg = Arc::clone(&wg);
                                tokio::spawn(connection::serve_conn(router, wg, sock));
                            }
                            Err(TransportError::ListenerClosed) => return,
                            Err(e) => {
                                error!(error = %e, "Accept error");
                                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            }
                        },
                    }
                }
            });
        }

        // Heartbeat + teardown loop.
        {
            let server = self.clone();
            let opts = opts.clone();
            tokio::spawn(async move {
                let mut heartbeat = if opts.register_interval > Duration::ZERO {
                    Some(tokio::time::interval_at(
                        tokio::time::Instant::now() + opts.register_interval,
                        opts.register_interval,
                    ))
                } else {
                    None
                };

                let reply = loop {
                    tokio::select! {
                        _ = maybe_tick(&mut heartbeat) => server.heartbeat(&opts).await,
                        exit = exit_rx.recv() => match exit {
                            Some(reply) => break reply,
                            None => return,
                        },
                    }
                };

                // Stop accepting, deregister, drain, close, disconnect.
                let _ = accept_exit_tx.send(true);

                if server.inner.lifecycle.read().await.registered {
                    if let Err(e) = server.deregister().await {
                        error!(app = %opts.name, id = %opts.id, error = %e, "Server deregister error");
                    }
                }

                server.inner.wg.wait().await;

                listener.close().await;

                if let Err(e) = opts.broker.disconnect().await {
                    error!(broker = %opts.broker.name(), error = %e, "Broker disconnect error");
                } else {
                    info!(
                        broker = %opts.broker.name(),
                        address = %opts.broker.address(),
                        "Broker disconnected"
                    );
                }

                {
                    let mut o = server.inner.opts.write().await;
                    o.address = original_address;
                }

                let _ = reply.send(Ok(()));
            });
        }

        let mut lifecycle = self.inner.lifecycle.write().await;
        lifecycle.started = true;
        lifecycle.exit_tx = Some(exit_tx);

        Ok(())
    }

    /// Signal exit and wait for the lifecycle loop to drain and close.
    pub async fn stop(&self) -> Result<()> {
        let exit_tx = {
            let lifecycle = self.inner.lifecycle.read().await;
            if !lifecycle.started {
                return Ok(());
            }
            lifecycle.exit_tx.clone()
        };
        let Some(exit_tx) = exit_tx else {
            return Ok(());
        };

        let (tx, rx) = oneshot::channel();
        exit_tx.send(tx).await.map_err(|_| ServerError::Shutdown)?;
        let result = rx.await.map_err(|_| ServerError::Shutdown)?;

        let mut lifecycle = self.inner.lifecycle.write().await;
        lifecycle.started = false;
        lifecycle.exit_tx = None;

        result
    }

    /// One heartbeat: re-run the health check, deregistering on failure
    /// and refreshing the registration on success.
    async fn heartbeat(&self, opts: &ServerOptions) {
        let registered = self.inner.lifecycle.read().await.registered;

        match (opts.register_check)().await {
            Err(e) if registered => {
                error!(
                    app = %opts.name,
                    id = %opts.id,
                    error = %e,
                    "Server register check error, deregistering"
                );
                if let Err(e) = self.deregister().await {
                    error!(app = %opts.name, id = %opts.id, error = %e, "Server deregister error");
                }
            }
            Err(e) => {
                error!(app = %opts.name, id = %opts.id, error = %e, "Server register check error");
            }
            Ok(()) => {
                if let Err(e) = self.register().await {
                    error!(app = %opts.name, id = %opts.id, error = %e, "Server register error");
                }
            }
        }
    }

    /// Register this server with the registry, binding subscriptions on
    /// first success.
    pub async fn register(&self) -> Result<()> {
        let opts = self.options().await;
        let Some(registry) = opts.registry.clone() else {
            return Ok(());
        };
        if registry.name() == "noop" {
            return Ok(());
        }

        // A cached registration skips the rebuild entirely.
        if let Some(app) = self.inner.lifecycle.read().await.cached_app.clone() {
            return self.register_with_retry(registry.as_ref(), &app, &opts).await;
        }

        let advertised = opts.advertise.clone().unwrap_or_else(|| opts.address.clone());
        let (host, port) = addr::parse_host_port(&advertised)?;
        let cache_app = addr::is_ip_literal(&host);
        let host = addr::extract(&host);
        // Queue-name addresses have no port to re-attach.
        let address = match port {
            Some(port) => addr::host_port(&host, &port),
            None => host,
        };

        let mut metadata = opts.metadata.clone();
        metadata.insert("network".to_string(), opts.transport.name().to_string());
        metadata.insert("event".to_string(), opts.broker.name().to_string());
        metadata.insert("server".to_string(), self.name().to_string());
        metadata.insert("registry".to_string(), registry.name().to_string());
        metadata.insert("protocol".to_string(), "rpc".to_string());

        let instance = Instance {
            id: format!("{}-{}", opts.name, opts.id),
            address,
            metadata,
        };

        // Advertised endpoints: non-internal handlers ordered by name,
        // then non-internal subscribers ordered reverse by topic.
        let mut endpoints = Vec::new();
        {
            let handlers = self.inner.handlers.read().await;
            let mut names: Vec<&String> = handlers
                .iter()
                .filter(|(_, h)| !h.internal())
                .map(|(name, _)| name)
                .collect();
            names.sort();
            for name in names {
                endpoints.extend(handlers[name].endpoints());
            }
        }
        {
            let subscribers = self.inner.subscribers.read().await;
            let mut entries: Vec<&SubscriberEntry> = subscribers
                .iter()
                .filter(|e| !e.subscriber.internal())
                .collect();
            entries.sort_by(|a, b| b.subscriber.topic().cmp(a.subscriber.topic()));
            for entry in entries {
                endpoints.extend(entry.subscriber.endpoints());
            }
        }

        let app = App {
            name: opts.name.clone(),
            version: opts.version.clone(),
            instances: vec![instance],
            endpoints,
            ..App::default()
        };

        let registered = self.inner.lifecycle.read().await.registered;
        if !registered {
            info!(
                registry = %registry.name(),
                instance = %app.instances[0].id,
                "Registering instance"
            );
        }

        self.register_with_retry(registry.as_ref(), &app, &opts).await?;

        // Subscriptions bind once, on the first successful registration.
        if registered {
            return Ok(());
        }

        {
            let mut o = self.inner.opts.write().await;
            o.advertise = Some(app.instances[0].address.clone());
        }

        let router = self.effective_router().await;
        let mut lifecycle = self.inner.lifecycle.write().await;

        if opts.router.is_some() {
            // A configured router can exchange messages addressed to the
            // server's own name.
            let bridge = Arc::new(BrokerEventBridge {
                router: Arc::clone(&router),
                topic: opts.name.clone(),
            });
            let sub = opts
                .broker
                .subscribe(&opts.name, bridge, SubscribeOptions::default())
                .await?;
            lifecycle.self_subscription = Some(sub);
        }

        let mut subscribers = self.inner.subscribers.write().await;
        for entry in subscribers.iter_mut() {
            let mut sub_opts = SubscribeOptions::default();
            if let Some(queue) = entry.subscriber.queue() {
                sub_opts = sub_opts.with_queue(queue);
            }
            let bridge = Arc::new(BrokerEventBridge {
                router: Arc::clone(&router),
                topic: entry.subscriber.topic().to_string(),
            });
            let sub = opts
                .broker
                .subscribe(entry.subscriber.topic(), bridge, sub_opts)
                .await?;
            info!(topic = %entry.subscriber.topic(), "Subscribed to event topic");
            entry.subscriptions.push(sub);
        }

        if cache_app {
            lifecycle.cached_app = Some(app);
        }
        lifecycle.registered = true;

        Ok(())
    }

    /// Deregister from the registry and unbind every subscription.
    pub async fn deregister(&self) -> Result<()> {
        let opts = self.options().await;
        let Some(registry) = opts.registry.clone() else {
            return Ok(());
        };
        if registry.name() == "noop" {
            return Ok(());
        }

        let advertised = opts.advertise.clone().unwrap_or_else(|| opts.address.clone());
        let (host, port) = addr::parse_host_port(&advertised)?;
        let host = addr::extract(&host);
        let address = match port {
            Some(port) => addr::host_port(&host, &port),
            None => host,
        };

        let instance = Instance {
            id: format!("{}-{}", opts.name, opts.id),
            address,
            metadata: HashMap::new(),
        };
        let app = App {
            name: opts.name.clone(),
            version: opts.version.clone(),
            instances: vec![instance],
            ..App::default()
        };

        info!(
            registry = %registry.name(),
            instance = %app.instances[0].id,
            "Deregistering instance"
        );
        registry
            .remove(
                &app,
                RemoveOptions::default().with_domain(opts.namespace.clone()),
            )
            .await?;

        let mut lifecycle = self.inner.lifecycle.write().await;
        lifecycle.cached_app = None;
        if !lifecycle.registered {
            return Ok(());
        }
        lifecycle.registered = false;

        if let Some(sub) = lifecycle.self_subscription.take() {
            sub.unsubscribe().await;
        }
        drop(lifecycle);

        let mut subscribers = self.inner.subscribers.write().await;
        for entry in subscribers.iter_mut() {
            for sub in entry.subscriptions.drain(..) {
                info!(topic = %sub.topic(), "Unsubscribed from event topic");
                sub.unsubscribe().await;
            }
        }

        Ok(())
    }

    async fn register_with_retry(
        &self,
        registry: &dyn Registry,
        app: &App,
        opts: &ServerOptions,
    ) -> Result<()> {
        let ttl = (opts.register_ttl > Duration::ZERO).then_some(opts.register_ttl);
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_times(REGISTER_ATTEMPTS)
            .build();

        let mut last_err = None;
        for attempt in 1..=REGISTER_ATTEMPTS {
            let add_opts = AddOptions {
                ttl,
                domain: opts.namespace.clone(),
            };
            match registry.add(app, add_opts).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        error = %e,
                        "Registry add failed, backing off"
                    );
                    last_err = Some(e);
                    if let Some(delay) = delays.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt ran").into())
    }
}

/// Delivers broker messages into the router's event path.
struct BrokerEventBridge {
    router: Arc<dyn Router>,
    topic: String,
}

#[async_trait]
impl broker::EventHandler for BrokerEventBridge {
    async fn handle(&self, msg: BrokerMessage) -> broker::Result<()> {
        let mut header = msg.header;
        header
            .entry("Event".to_string())
            .or_insert_with(|| self.topic.clone());
        let body: Bytes = msg.body;
        connection::dispatch_event(&self.router, &header, &body)
            .await
            .map_err(|e| broker::BrokerError::Handler(e.to_string()))
    }
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
