//! End-to-end tests for the RPC server: connection demux, codec
//! selection, lifecycle registration and graceful stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use weft::broker::{Broker, MemoryBroker, BrokerMessage};
use weft::codec::{Payload, CONTENT_TYPE_RAW};
use weft::registry::{
    AddOptions, App, GetOptions, ListOptions, MemoryRegistry, Registry, RegistryError,
    RemoveOptions, WatchOptions, Watcher,
};
use weft::server::{
    Context, EventMessage, Handler, RpcRequest, RpcResponse, RpcServer, ServerError,
    ServerOptions, Subscriber,
};
use weft::transport::{MemoryTransport, Message, Transport};

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    fn name(&self) -> &str {
        "Ping"
    }

    async fn serve(
        &self,
        _ctx: Context,
        _req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<(), ServerError> {
        rsp.write(Payload::Raw(Bytes::from_static(b"pong"))).await
    }
}

struct StreamEchoHandler;

#[async_trait]
impl Handler for StreamEchoHandler {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn serve(
        &self,
        _ctx: Context,
        req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<(), ServerError> {
        let seed = String::from_utf8_lossy(req.body()).to_string();
        for i in 0..3 {
            rsp.write(Payload::Raw(Bytes::from(format!("{seed}-{i}"))))
                .await?;
        }
        Ok(())
    }
}

struct JsonGreeter;

#[async_trait]
impl Handler for JsonGreeter {
    fn name(&self) -> &str {
        "Greeter"
    }

    async fn serve(
        &self,
        _ctx: Context,
        _req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<(), ServerError> {
        rsp.write(Payload::Json(serde_json::json!({"msg": "hello"})))
            .await
    }
}

struct SlowHandler;

#[async_trait]
impl Handler for SlowHandler {
    fn name(&self) -> &str {
        "Slow"
    }

    async fn serve(
        &self,
        _ctx: Context,
        _req: &mut RpcRequest,
        rsp: &RpcResponse,
    ) -> Result<(), ServerError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        rsp.write(Payload::Raw(Bytes::from_static(b"late"))).await
    }
}

struct CountingSubscriber {
    count: AtomicUsize,
}

impl CountingSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Subscriber for CountingSubscriber {
    fn topic(&self) -> &str {
        "updates"
    }

    async fn process(&self, _ctx: Context, _msg: &EventMessage) -> Result<(), ServerError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry that fails the first N add calls, then delegates.
struct FlakyRegistry {
    inner: MemoryRegistry,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyRegistry {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryRegistry::new(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn add(&self, app: &App, opts: AddOptions) -> Result<(), RegistryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(RegistryError::Unavailable("registry flapping".to_string()));
        }
        self.inner.add(app, opts).await
    }

    async fn remove(&self, app: &App, opts: RemoveOptions) -> Result<(), RegistryError> {
        self.inner.remove(app, opts).await
    }

    async fn get(&self, name: &str, opts: GetOptions) -> Result<Vec<App>, RegistryError> {
        self.inner.get(name, opts).await
    }

    async fn list(&self, opts: ListOptions) -> Result<Vec<App>, RegistryError> {
        self.inner.list(opts).await
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Watcher, RegistryError> {
        self.inner.watch(opts).await
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn request(id: &str, endpoint: &str, body: &str) -> Message {
    Message::new(body.as_bytes().to_vec())
        .with_header("Id", id)
        .with_header("Endpoint", endpoint)
        .with_header("Content-Type", CONTENT_TYPE_RAW)
        .with_header("Protocol", "rpc")
}

#[tokio::test]
async fn test_ping_pong_over_two_connections() {
    weft::utils::bootstrap::init_tracing();

    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("pinger")
            .with_transport(transport.clone()),
    );
    server.handle(Arc::new(PingHandler)).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;

    let mut clients = Vec::new();
    for c in 0..2 {
        let transport = transport.clone();
        let addr = addr.clone();
        clients.push(tokio::spawn(async move {
            let sock = transport.dial(&addr).await.unwrap();
            for i in 0..3 {
                let id = format!("{c}-{i}");
                sock.send(request(&id, "Ping.Call", "ping")).await.unwrap();
                let reply = sock.recv().await.unwrap();
                assert_eq!(&reply.body[..], b"pong");
                assert_eq!(reply.header.get("Id").unwrap(), &id);
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_streams_preserve_per_stream_order() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("echoer")
            .with_transport(transport.clone()),
    );
    server.handle(Arc::new(StreamEchoHandler)).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    for stream in ["a", "b"] {
        let msg = Message::new(stream.to_uppercase())
            .with_header("Stream", stream)
            .with_header("Endpoint", "Echo.Call")
            .with_header("Content-Type", CONTENT_TYPE_RAW)
            .with_header("Protocol", "rpc");
        sock.send(msg).await.unwrap();
    }

    let mut per_stream: HashMap<String, Vec<String>> = HashMap::new();
    for _ in 0..6 {
        let reply = sock.recv().await.unwrap();
        let stream = reply.header.get("Stream").cloned().unwrap();
        per_stream
            .entry(stream)
            .or_default()
            .push(String::from_utf8_lossy(&reply.body).to_string());
    }

    assert_eq!(per_stream["a"], vec!["A-0", "A-1", "A-2"]);
    assert_eq!(per_stream["b"], vec!["B-0", "B-1", "B-2"]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_header_bounds_handler() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("sleeper")
            .with_transport(transport.clone()),
    );
    server.handle(Arc::new(SlowHandler)).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    let started = std::time::Instant::now();
    let msg = request("t1", "Slow.Call", "").with_header("Timeout", "50000000");
    sock.send(msg).await.unwrap();

    let reply = sock.recv().await.unwrap();
    assert_eq!(reply.header.get("Error").unwrap(), "request timed out");
    // Well before the handler's 500ms of work would have completed.
    assert!(started.elapsed() < Duration::from_millis(400));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_content_type() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("typed")
            .with_transport(transport.clone()),
    );
    server.handle(Arc::new(PingHandler)).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    let msg = Message::new("ping")
        .with_header("Id", "u1")
        .with_header("Endpoint", "Ping.Call")
        .with_header("Content-Type", "text/unknown");
    sock.send(msg).await.unwrap();

    let reply = sock.recv().await.unwrap();
    assert_eq!(reply.header.get("Content-Type").unwrap(), "text/plain");
    let body = String::from_utf8_lossy(&reply.body);
    assert!(body.contains("Unsupported Content-Type"), "body: {body}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_endpoint_answers_with_error() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("empty")
            .with_transport(transport.clone()),
    );
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    sock.send(request("x1", "Nope.Call", "")).await.unwrap();
    let reply = sock.recv().await.unwrap();
    assert!(reply
        .header
        .get("Error")
        .unwrap()
        .contains("unknown endpoint: Nope.Call"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_event_messages_are_dispatched_and_acked() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("events")
            .with_transport(transport.clone()),
    );
    let subscriber = CountingSubscriber::new();
    server.subscribe(subscriber.clone()).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    let msg = Message::new(r#"{"n":1}"#)
        .with_header("Event", "updates")
        .with_header("Content-Type", "application/json");
    sock.send(msg).await.unwrap();

    let ack = sock.recv().await.unwrap();
    assert_eq!(ack.header.get("Event").unwrap(), "updates");
    assert!(!ack.header.contains_key("Error"), "ack: {:?}", ack.header);
    assert_eq!(subscriber.count.load(Ordering::SeqCst), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_registration_publishes_instance_metadata() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("greeter")
            .with_version("1.2.0")
            .with_registry(registry.clone()),
    );
    server.handle(Arc::new(PingHandler)).await;
    server.start().await.unwrap();

    let apps = registry.get("greeter", GetOptions::default()).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].version, "1.2.0");
    assert_eq!(apps[0].instances.len(), 1);

    let metadata = &apps[0].instances[0].metadata;
    assert_eq!(metadata.get("protocol").unwrap(), "rpc");
    assert_eq!(metadata.get("server").unwrap(), "rpc");
    assert_eq!(metadata.get("network").unwrap(), "memory");
    assert_eq!(metadata.get("event").unwrap(), "memory");
    assert_eq!(metadata.get("registry").unwrap(), "memory");

    server.stop().await.unwrap();

    // Graceful stop deregisters.
    assert!(matches!(
        registry.get("greeter", GetOptions::default()).await,
        Err(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn test_register_retries_without_duplicate_subscriptions() {
    let registry = Arc::new(FlakyRegistry::new(2));
    let broker = Arc::new(MemoryBroker::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("flaky")
            .with_registry(registry.clone())
            .with_broker(broker.clone()),
    );
    let subscriber = CountingSubscriber::new();
    server.subscribe(subscriber.clone()).await;
    server.start().await.unwrap();

    // Two failures, success on the third attempt.
    assert_eq!(registry.attempts.load(Ordering::SeqCst), 3);
    assert!(registry.get("flaky", GetOptions::default()).await.is_ok());

    // Exactly one live subscription: one publish, one delivery.
    broker
        .publish("updates", &BrokerMessage::new(r#"{"n":1}"#))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(subscriber.count.load(Ordering::SeqCst), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_listener() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("stopper")
            .with_transport(transport.clone()),
    );
    server.start().await.unwrap();
    let addr = server.options().await.address;

    server.stop().await.unwrap();

    assert!(transport.dial(&addr).await.is_err());
    // The configured address is restored after stop.
    assert_eq!(server.options().await.address, "127.0.0.1:0");
}

#[tokio::test]
async fn test_legacy_json_peers_get_json_rpc_responses() {
    let transport = Arc::new(MemoryTransport::new());
    let server = RpcServer::new(
        ServerOptions::default()
            .with_name("legacy")
            .with_transport(transport.clone()),
    );
    server.handle(Arc::new(JsonGreeter)).await;
    server.start().await.unwrap();

    let addr = server.options().await.address;
    let sock = transport.dial(&addr).await.unwrap();

    // No Protocol hint: the json content type is rewritten for the
    // legacy codec map.
    let msg = Message::new(r#"{"id":"l1","method":"Greeter.Hello","params":{}}"#)
        .with_header("Id", "l1")
        .with_header("Endpoint", "Greeter.Hello")
        .with_header("Content-Type", "application/json");
    sock.send(msg).await.unwrap();

    let reply = sock.recv().await.unwrap();
    assert_eq!(
        reply.header.get("Content-Type").unwrap(),
        "application/json-rpc"
    );
    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["id"], "l1");
    assert_eq!(body["result"]["msg"], "hello");

    server.stop().await.unwrap();
}
