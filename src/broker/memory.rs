//! In-memory broker for tests and single-process deployments.
//!
//! Topics map to subscriber lists. Publishing delivers to every plain
//! subscriber and to one random member per queue group; handlers run on
//! their own tasks so a slow subscriber never blocks the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Broker, BrokerError, BrokerMessage, EventHandler, Result, SubscribeOptions, Subscription,
};

struct SubscriberEntry {
    id: Uuid,
    queue: Option<String>,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<String, Vec<SubscriberEntry>>,
}

/// In-memory [`Broker`] implementation.
#[derive(Default)]
pub struct MemoryBroker {
    connected: AtomicBool,
    state: Arc<RwLock<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, topic: &str, msg: &BrokerMessage) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }

        let state = self.state.read().await;
        let Some(entries) = state.subscribers.get(topic) else {
            return Ok(());
        };

        // Plain subscribers all receive the message; each queue group
        // elects one member.
        let mut queues: HashMap<&str, Vec<&SubscriberEntry>> = HashMap::new();
        let mut targets: Vec<&SubscriberEntry> = Vec::new();
        for entry in entries {
            match entry.queue.as_deref() {
                Some(queue) => queues.entry(queue).or_default().push(entry),
                None => targets.push(entry),
            }
        }
        for members in queues.values() {
            let pick = rand::thread_rng().gen_range(0..members.len());
            targets.push(members[pick]);
        }

        for entry in targets {
            let handler = Arc::clone(&entry.handler);
            let msg = msg.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(msg).await {
                    warn!(topic = %topic, error = %e, "Subscriber failed");
                }
            });
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        opts: SubscribeOptions,
    ) -> Result<Arc<dyn Subscription>> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }

        let entry = SubscriberEntry {
            id: Uuid::new_v4(),
            queue: opts.queue,
            handler,
        };
        let id = entry.id;

        let mut state = self.state.write().await;
        state
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(entry);
        debug!(topic = %topic, "Subscribed");

        Ok(Arc::new(MemorySubscription {
            id,
            topic: topic.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    fn address(&self) -> String {
        "memory".to_string()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    id: Uuid,
    topic: String,
    state: Arc<RwLock<BrokerState>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) {
        let mut state = self.state.write().await;
        if let Some(entries) = state.subscribers.get_mut(&self.topic) {
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                state.subscribers.remove(&self.topic);
            }
        }
        debug!(topic = %self.topic, "Unsubscribed");
    }
}
