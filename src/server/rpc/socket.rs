//! Virtual sockets: per-stream channel pairs multiplexed over one
//! underlying connection.
//!
//! The connection reader delivers inbound messages into a stream's
//! channel through the pool; the stream's writer worker drains the
//! outbound side onto the real socket. Releasing a stream removes it
//! from the pool and closes its inbound channel, which readers observe
//! as shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::server::ServerError;
use crate::transport::Message;

/// Buffered inbound messages per stream.
const INBOUND_BUFFER: usize = 64;

/// Buffered outbound messages per stream.
const OUTBOUND_BUFFER: usize = 64;

/// One logical stream over a shared connection.
pub(crate) struct VirtualSocket {
    local: String,
    remote: String,
    inbound: Mutex<mpsc::Receiver<Message>>,
    outbound: mpsc::Sender<Message>,
}

impl VirtualSocket {
    pub(crate) fn local(&self) -> &str {
        &self.local
    }

    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    /// Receive the next inbound message for this stream.
    pub(crate) async fn recv(&self) -> Result<Message, ServerError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(ServerError::Shutdown)
    }

    /// Queue a message for the stream's writer.
    pub(crate) async fn send(&self, msg: Message) -> Result<(), ServerError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ServerError::Shutdown)
    }
}

/// Stream-id → inbound channel mapping for one connection.
#[derive(Default)]
pub(crate) struct StreamPool {
    streams: Mutex<HashMap<String, mpsc::Sender<Message>>>,
}

impl StreamPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The inbound sender for an existing stream.
    pub(crate) async fn get(&self, id: &str) -> Option<mpsc::Sender<Message>> {
        self.streams.lock().await.get(id).cloned()
    }

    /// Create a stream, returning its virtual socket and the outbound
    /// receiver for the writer worker.
    pub(crate) async fn create(
        &self,
        id: &str,
        local: String,
        remote: String,
    ) -> (Arc<VirtualSocket>, mpsc::Receiver<Message>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let socket = Arc::new(VirtualSocket {
            local,
            remote,
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
        });

        self.streams
            .lock()
            .await
            .insert(id.to_string(), inbound_tx);

        (socket, outbound_rx)
    }

    /// Remove a stream. Its readers observe shutdown on the next recv.
    pub(crate) async fn release(&self, id: &str) {
        self.streams.lock().await.remove(id);
    }

    /// Remove every stream, waking all blocked readers.
    pub(crate) async fn clear(&self) {
        self.streams.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_and_recv() {
        let pool = StreamPool::new();
        let (socket, _out_rx) = pool.create("1", "l".into(), "r".into()).await;

        let tx = pool.get("1").await.unwrap();
        tx.send(Message::new("hello")).await.unwrap();

        let msg = socket.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_release_closes_inbound() {
        let pool = StreamPool::new();
        let (socket, _out_rx) = pool.create("1", "l".into(), "r".into()).await;

        pool.release("1").await;

        assert!(pool.get("1").await.is_none());
        assert!(matches!(socket.recv().await, Err(ServerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_outbound_reaches_writer() {
        let pool = StreamPool::new();
        let (socket, mut out_rx) = pool.create("1", "l".into(), "r".into()).await;

        socket.send(Message::new("out")).await.unwrap();
        let msg = out_rx.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"out");

        // Dropping the socket closes the outbound channel.
        drop(socket);
        pool.release("1").await;
        assert!(out_rx.recv().await.is_none());
    }
}
