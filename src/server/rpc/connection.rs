//! Per-connection demultiplexer.
//!
//! One reader loop per accepted socket. Each inbound message is either
//! an event (dispatched and acked in place) or part of a stream: known
//! stream ids are delivered into their virtual socket, unknown ids open
//! a new stream backed by exactly two workers: a writer draining the
//! stream's outbound channel onto the socket, and a handler running the
//! router. Worker panics are contained and logged; they never take the
//! reader loop down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::codec::{codec_for, setup_protocol, DEFAULT_CONTENT_TYPE};
use crate::server::{Context, Result, Router, ServerError, EOS};
use crate::transport::{Message, Socket};
use crate::utils::wait::WaitGroup;

use super::request::{EventMessage, RpcRequest, RpcResponse};
use super::socket::StreamPool;

/// Serve one accepted connection until the peer closes or the read
/// fails.
pub(crate) async fn serve_conn(
    router: Arc<dyn Router>,
    wg: Arc<WaitGroup>,
    sock: Arc<dyn Socket>,
) {
    let pool = Arc::new(StreamPool::new());
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        let mut msg = match sock.recv().await {
            Ok(msg) => msg,
            Err(_) => break,
        };

        // Opportunistically reap finished workers so contained panics
        // surface promptly.
        while let Some(result) = workers.try_join_next() {
            log_worker_exit(result);
        }

        // Event messages are dispatched in place and acked with the
        // original headers; they never allocate a stream.
        if msg.header.get("Event").is_some_and(|e| !e.is_empty()) {
            let mut header = msg.header.clone();
            if let Err(e) = dispatch_event(&router, &msg.header, &msg.body).await {
                header.insert("Error".to_string(), e.to_string());
            }
            if sock
                .send(Message {
                    header,
                    body: Bytes::new(),
                })
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        // Streams multiplex on the Stream header, falling back to Id.
        let stream = msg.header.get("Stream").is_some_and(|s| !s.is_empty());
        let id = msg
            .header
            .get("Stream")
            .filter(|s| !s.is_empty())
            .or_else(|| msg.header.get("Id"))
            .cloned()
            .unwrap_or_default();

        if let Some(inbound) = pool.get(&id).await {
            let _guard = wg.guard();
            if inbound.send(msg).await.is_err() {
                pool.release(&id).await;
            }
            continue;
        }

        // A trailing end-of-stream marker for a stream we already
        // released carries nothing to do.
        if stream && msg.header.get("Error").map(String::as_str) == Some(EOS) {
            continue;
        }

        // New stream.
        let deadline = msg
            .header
            .get("Timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .map(|nanos| Instant::now() + Duration::from_nanos(nanos));

        let content_type = msg
            .header
            .get("Content-Type")
            .filter(|ct| !ct.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        // Legacy peers without a protocol hint get the legacy codec map;
        // everyone else resolves through the main one.
        let (content_type, codec) = match setup_protocol(&msg.header) {
            Some((rewritten, codec)) => (rewritten, codec),
            None => match codec_for(&content_type) {
                Ok(codec) => (content_type, codec),
                Err(e) => {
                    let mut header = HashMap::new();
                    header.insert("Content-Type".to_string(), "text/plain".to_string());
                    if !id.is_empty() {
                        header.insert("Id".to_string(), id.clone());
                    }
                    if sock
                        .send(Message {
                            header,
                            body: Bytes::from(e.to_string()),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            },
        };
        msg.header
            .insert("Content-Type".to_string(), content_type.clone());

        let mut ctx_header = msg.header.clone();
        ctx_header.insert("Local".to_string(), sock.local());
        ctx_header.insert("Remote".to_string(), sock.remote());
        let mut ctx = Context::new(ctx_header);
        if let Some(deadline) = deadline {
            ctx = ctx.with_deadline(deadline);
        }

        let (vsocket, mut outbound) = pool.create(&id, sock.local(), sock.remote()).await;

        let request = RpcRequest::new(
            msg.header.clone(),
            msg.body.clone(),
            content_type,
            stream,
            Arc::clone(&vsocket),
            Arc::clone(&codec),
        );
        let response = RpcResponse::new(
            msg.header.clone(),
            stream.then(|| id.clone()),
            Arc::clone(&vsocket),
            Arc::clone(&codec),
        );

        // Writer: outbound channel → socket, in order.
        {
            let sock = Arc::clone(&sock);
            let pool = Arc::clone(&pool);
            let id = id.clone();
            let guard = wg.guard();
            workers.spawn(async move {
                let _guard = guard;
                while let Some(out) = outbound.recv().await {
                    if sock.send(out).await.is_err() {
                        break;
                    }
                }
                pool.release(&id).await;
            });
        }

        // Handler: run the router, bounded by the request deadline.
        {
            let router = Arc::clone(&router);
            let pool = Arc::clone(&pool);
            let id = id.clone();
            let guard = wg.guard();
            workers.spawn(async move {
                let _guard = guard;
                let mut request = request;

                let result = match deadline {
                    Some(deadline) => {
                        let serve = router.serve_request(ctx, &mut request, &response);
                        match tokio::time::timeout_at(deadline, serve).await {
                            Ok(result) => result,
                            Err(_) => Err(ServerError::Timeout),
                        }
                    }
                    None => router.serve_request(ctx, &mut request, &response).await,
                };

                if let Err(e) = result {
                    // The peer learns of the failure (end-of-stream
                    // included) through an error-typed message.
                    if let Err(write_err) = response.write_error(&e).await {
                        debug!(error = %write_err, "Unable to write error response");
                    }
                }

                pool.release(&id).await;
                // Dropping request/response closes the outbound channel;
                // the writer drains what remains and exits.
            });
        }
    }

    // Wake any reader blocked on a stream, drain the workers, then shut
    // the socket.
    pool.clear().await;
    while let Some(result) = workers.join_next().await {
        log_worker_exit(result);
    }
    sock.close().await;
}

/// Dispatch one event message through the router.
///
/// Shared between the connection event path and broker subscriptions.
pub(crate) async fn dispatch_event(
    router: &Arc<dyn Router>,
    header: &HashMap<String, String>,
    body: &Bytes,
) -> Result<()> {
    let topic = header.get("Event").cloned().unwrap_or_default();
    let content_type = header
        .get("Content-Type")
        .filter(|ct| !ct.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let codec = codec_for(&content_type)?;

    let msg = EventMessage::new(
        topic,
        content_type,
        header.clone(),
        body.clone(),
        codec,
    );
    let ctx = Context::new(header.clone());
    router.process_message(ctx, &msg).await
}

fn log_worker_exit(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(panic = %e, "Recovered panic in stream worker");
        }
    }
}
