//! In-memory cache.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{Cache, CacheError, Result};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`Cache`] implementation with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    values: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Value> {
        {
            let values = self.values.read().await;
            match values.get(key) {
                Some(entry) if !entry.expired() => return Ok(entry.value.clone()),
                Some(_) => {}
                None => return Err(CacheError::NotFound(key.to_string())),
            }
        }

        // Expired: drop the entry before reporting the miss.
        let mut values = self.values.write().await;
        if values.get(key).is_some_and(|entry| entry.expired()) {
            values.remove(key);
        }
        Err(CacheError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.values.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
