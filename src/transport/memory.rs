//! In-memory transport for tests and single-process deployments.
//!
//! Listeners live in a table keyed by address; dialing creates a crossed
//! pair of channels and hands the server end to the listener's accept
//! queue. Closing either end of a pair tears the connection down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

use super::{Listener, Message, Result, Socket, Transport, TransportError};

/// Queued connections per listener.
const ACCEPT_BACKLOG: usize = 64;

/// Buffered messages per socket direction.
const SOCKET_BUFFER: usize = 64;

/// Close signal shared by both ends of a socket pair.
#[derive(Default)]
struct PairState {
    closed: AtomicBool,
    notify: Notify,
}

impl PairState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }
}

struct MemorySocket {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    local: String,
    remote: String,
    pair: Arc<PairState>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&self, msg: Message) -> Result<()> {
        if self.pair.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx.send(msg).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Message> {
        if self.pair.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        let closed = self.pair.notify.notified();
        tokio::select! {
            _ = closed => Err(TransportError::Closed),
            msg = rx.recv() => msg.ok_or(TransportError::Closed),
        }
    }

    fn local(&self) -> String {
        self.local.clone()
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self) {
        self.pair.close();
    }
}

struct MemoryListener {
    addr: String,
    accept_rx: Mutex<mpsc::Receiver<Arc<MemorySocket>>>,
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Arc<MemorySocket>>>>>,
    closed: Arc<PairState>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<Arc<dyn Socket>> {
        if self.closed.is_closed() {
            return Err(TransportError::ListenerClosed);
        }

        let mut rx = self.accept_rx.lock().await;
        let closed = self.closed.notify.notified();
        tokio::select! {
            _ = closed => Err(TransportError::ListenerClosed),
            sock = rx.recv() => match sock {
                Some(sock) => Ok(sock as Arc<dyn Socket>),
                None => Err(TransportError::ListenerClosed),
            },
        }
    }

    async fn close(&self) {
        self.closed.close();
        self.listeners.lock().await.remove(&self.addr);
    }
}

/// In-memory [`Transport`] implementation.
#[derive(Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Arc<MemorySocket>>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize an address, assigning a random free port for `:0`.
    fn resolve_addr(
        addr: &str,
        listeners: &HashMap<String, mpsc::Sender<Arc<MemorySocket>>>,
    ) -> Result<String> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
        let host = if host.is_empty() { "127.0.0.1" } else { host };

        if port == "0" {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = format!("{}:{}", host, rng.gen_range(10000..60000));
                if !listeners.contains_key(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        Ok(format!("{}:{}", host, port))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>> {
        let mut listeners = self.listeners.lock().await;

        let addr = Self::resolve_addr(addr, &listeners)?;
        if listeners.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr));
        }

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(addr.clone(), accept_tx);
        debug!(address = %addr, "Listening");

        Ok(Arc::new(MemoryListener {
            addr,
            accept_rx: Mutex::new(accept_rx),
            listeners: Arc::clone(&self.listeners),
            closed: Arc::new(PairState::default()),
        }))
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Socket>> {
        let accept_tx = {
            let listeners = self.listeners.lock().await;
            listeners
                .get(addr)
                .cloned()
                .ok_or_else(|| TransportError::Refused(addr.to_string()))?
        };

        let local = format!("127.0.0.1:{}", rand::thread_rng().gen_range(10000..60000));
        let (client_tx, client_rx) = mpsc::channel(SOCKET_BUFFER);
        let (server_tx, server_rx) = mpsc::channel(SOCKET_BUFFER);
        let pair = Arc::new(PairState::default());

        let client = Arc::new(MemorySocket {
            tx: client_tx,
            rx: Mutex::new(server_rx),
            local: local.clone(),
            remote: addr.to_string(),
            pair: Arc::clone(&pair),
        });
        let server = Arc::new(MemorySocket {
            tx: server_tx,
            rx: Mutex::new(client_rx),
            local: addr.to_string(),
            remote: local,
            pair,
        });

        accept_tx
            .send(server)
            .await
            .map_err(|_| TransportError::Refused(addr.to_string()))?;

        Ok(client as Arc<dyn Socket>)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_ping_pong() {
        let transport = MemoryTransport::new();

        let listener = transport.listen("127.0.0.1:8080").await.unwrap();

        let server = tokio::spawn(async move {
            let sock = listener.accept().await.unwrap();
            while let Ok(msg) = sock.recv().await {
                assert_eq!(&msg.body[..], b"ping");
                if sock.send(Message::new("pong")).await.is_err() {
                    return;
                }
            }
        });

        let client = transport.dial("127.0.0.1:8080").await.unwrap();
        for _ in 0..3 {
            client.send(Message::new("ping")).await.unwrap();
            let reply = client.recv().await.unwrap();
            assert_eq!(&reply.body[..], b"pong");
        }

        client.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_binding() {
        let transport = MemoryTransport::new();

        // Random ports never collide with each other.
        let l1 = transport.listen(":0").await.unwrap();
        let l2 = transport.listen(":0").await.unwrap();
        assert_ne!(l1.addr(), l2.addr());

        // Binding a taken port fails.
        let _l3 = transport.listen(":8080").await.unwrap();
        assert!(matches!(
            transport.listen(":8080").await,
            Err(TransportError::AddrInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_listener_refuses_dial() {
        let transport = MemoryTransport::new();

        let listener = transport.listen(":0").await.unwrap();
        let addr = listener.addr();
        listener.close().await;

        assert!(matches!(
            transport.dial(&addr).await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_peer() {
        let transport = MemoryTransport::new();
        let listener = transport.listen(":0").await.unwrap();
        let addr = listener.addr();

        let client = transport.dial(&addr).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.close().await;
        assert!(matches!(server.recv().await, Err(TransportError::Closed)));
    }
}
