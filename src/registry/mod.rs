//! Service registry - discovery of application versions and instances.
//!
//! This module contains:
//! - The registry data model: [`App`], [`Instance`], [`Endpoint`]
//! - The [`Registry`] trait implemented by registry backends
//! - [`Watcher`], a filtered stream of registry change events
//! - The in-memory implementation in [`memory`]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryRegistry;

/// The domain used when callers do not specify one.
pub const DEFAULT_DOMAIN: &str = "weft";

/// Wildcard matching every domain in queries.
pub const WILDCARD_DOMAIN: &str = "*";

/// Internal alias accepted by watchers to mean "all domains".
pub const GLOBAL_DOMAIN: &str = "global";

/// Metadata key under which the registration domain is mirrored.
pub const DOMAIN_KEY: &str = "domain";

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("not found")]
    NotFound,

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// A logical service identity: name + version and its backing instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// One physical endpoint of an [`App`], keyed by id.
///
/// The address is a `host:port` pair or an opaque queue name for
/// message-queue transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A callable endpoint advertised by an [`App`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default)]
    pub request: Option<EndpointValue>,
    #[serde(default)]
    pub response: Option<EndpointValue>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A schema node describing an endpoint request or response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointValue {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: Vec<EndpointValue>,
}

/// The kind of change a registry event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Create => write!(f, "create"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A registry change event delivered to watchers.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub app: App,
}

/// Options for [`Registry::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Instance liveness TTL. `None` disables expiry.
    pub ttl: Option<Duration>,
    /// Registration domain; empty resolves to [`DEFAULT_DOMAIN`].
    pub domain: String,
}

impl AddOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Options for [`Registry::remove`].
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub domain: String,
}

impl RemoveOptions {
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Options for [`Registry::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Domain to query; [`WILDCARD_DOMAIN`] queries all of them.
    pub domain: String,
}

impl GetOptions {
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Options for [`Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub domain: String,
}

impl ListOptions {
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Options for [`Registry::watch`].
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Only deliver events for this app name. Empty matches every app.
    pub app: String,
    /// Only deliver events for this domain. [`GLOBAL_DOMAIN`] and
    /// [`WILDCARD_DOMAIN`] match every domain.
    pub domain: String,
}

impl WatchOptions {
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Interface for service registries.
///
/// Implementations store which application versions exist and which
/// instances back them, and stream change events to watchers.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register an app, merging its instances into any existing record.
    async fn add(&self, app: &App, opts: AddOptions) -> Result<()>;

    /// Deregister instances of an app. Unknown apps are a silent no-op.
    async fn remove(&self, app: &App, opts: RemoveOptions) -> Result<()>;

    /// Get every version of the named app.
    async fn get(&self, name: &str, opts: GetOptions) -> Result<Vec<App>>;

    /// List all registered apps, each version as its own entry.
    async fn list(&self, opts: ListOptions) -> Result<Vec<App>>;

    /// Create a watcher streaming change events matching the filter.
    async fn watch(&self, opts: WatchOptions) -> Result<Watcher>;

    /// Name of the implementation.
    fn name(&self) -> &'static str;
}

/// Shared stop signal between a [`Watcher`] and the table fan-out.
#[derive(Debug, Default)]
pub(crate) struct WatcherSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl WatcherSignal {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }
}

/// A filtered subscription to registry change events.
///
/// Watchers are single-consumer: only one task should call [`Watcher::next`].
pub struct Watcher {
    id: Uuid,
    opts: WatchOptions,
    rx: mpsc::Receiver<Event>,
    signal: Arc<WatcherSignal>,
}

impl Watcher {
    pub(crate) fn new(
        opts: WatchOptions,
        rx: mpsc::Receiver<Event>,
        signal: Arc<WatcherSignal>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            opts,
            rx,
            signal,
        }
    }

    /// Unique id of this watcher.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Return the next event matching the watcher's filters.
    ///
    /// Blocks until a matching event arrives or [`Watcher::stop`] is
    /// called, in which case `RegistryError::WatcherStopped` is returned.
    pub async fn next(&mut self) -> Result<Event> {
        let signal = Arc::clone(&self.signal);
        loop {
            if signal.is_stopped() {
                return Err(RegistryError::WatcherStopped);
            }

            let stopped = signal.notify.notified();
            tokio::select! {
                _ = stopped => return Err(RegistryError::WatcherStopped),
                event = self.rx.recv() => match event {
                    Some(event) if self.matches(&event) => return Ok(event),
                    Some(_) => continue,
                    // The table was dropped out from under us.
                    None => return Err(RegistryError::WatcherStopped),
                },
            }
        }
    }

    /// Stop the watcher. Idempotent; repeated calls are no-ops.
    pub fn stop(&self) {
        self.signal.stop();
    }

    fn matches(&self, event: &Event) -> bool {
        if !self.opts.app.is_empty() && self.opts.app != event.app.name {
            return false;
        }

        // The domain travels in the app metadata so it survives fan-out.
        let domain = event
            .app
            .metadata
            .get(DOMAIN_KEY)
            .filter(|d| !d.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_DOMAIN);

        self.opts.domain == GLOBAL_DOMAIN
            || self.opts.domain == WILDCARD_DOMAIN
            || self.opts.domain == domain
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, domain: &str) -> Event {
        let mut metadata = HashMap::new();
        if !domain.is_empty() {
            metadata.insert(DOMAIN_KEY.to_string(), domain.to_string());
        }
        Event {
            kind: EventKind::Create,
            app: App {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                metadata,
                ..App::default()
            },
        }
    }

    #[tokio::test]
    async fn test_watcher_delivers_matching_event() {
        let (tx, rx) = mpsc::channel(1);
        let mut w = Watcher::new(
            WatchOptions::default().with_domain(WILDCARD_DOMAIN),
            rx,
            Arc::new(WatcherSignal::default()),
        );

        tx.send(event("foo", DEFAULT_DOMAIN)).await.unwrap();

        let got = w.next().await.unwrap();
        assert_eq!(got.app.name, "foo");
    }

    #[tokio::test]
    async fn test_watcher_filters_by_app_and_domain() {
        let (tx, rx) = mpsc::channel(4);
        let mut w = Watcher::new(
            WatchOptions::default()
                .with_app("foo")
                .with_domain("one"),
            rx,
            Arc::new(WatcherSignal::default()),
        );

        tx.send(event("bar", "one")).await.unwrap();
        tx.send(event("foo", "two")).await.unwrap();
        tx.send(event("foo", "one")).await.unwrap();

        let got = w.next().await.unwrap();
        assert_eq!(got.app.name, "foo");
        assert_eq!(got.app.metadata.get(DOMAIN_KEY).unwrap(), "one");
    }

    #[tokio::test]
    async fn test_watcher_missing_domain_defaults() {
        let (tx, rx) = mpsc::channel(1);
        let mut w = Watcher::new(
            WatchOptions::default().with_domain(DEFAULT_DOMAIN),
            rx,
            Arc::new(WatcherSignal::default()),
        );

        tx.send(event("foo", "")).await.unwrap();

        assert!(w.next().await.is_ok());
    }

    #[tokio::test]
    async fn test_watcher_stop_is_idempotent() {
        let (_tx, rx) = mpsc::channel::<Event>(1);
        let mut w = Watcher::new(
            WatchOptions::default(),
            rx,
            Arc::new(WatcherSignal::default()),
        );

        w.stop();
        w.stop();

        assert!(matches!(
            w.next().await,
            Err(RegistryError::WatcherStopped)
        ));
    }
}
