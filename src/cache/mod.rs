//! Key/value cache abstraction.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub mod memory;

pub use memory::MemoryCache;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{0} not found")]
    NotFound(String),
}

/// Interface for caches.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> Result<Value>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Delete a value.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Name of the implementation.
    fn name(&self) -> &'static str;
}
