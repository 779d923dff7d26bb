//! In-memory registry backend.
//!
//! The authoritative table maps domain → app name → version → record,
//! with instances keyed by id so per-instance TTL refresh is O(1). A
//! background pruner sweeps expired instances and a fan-out task streams
//! change events to watchers with a bounded per-watcher send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    AddOptions, App, Endpoint, Event, EventKind, GetOptions, Instance, ListOptions, Registry,
    RegistryError, RemoveOptions, Result, WatchOptions, Watcher, WatcherSignal, DEFAULT_DOMAIN,
    DOMAIN_KEY, WILDCARD_DOMAIN,
};

/// How often the pruner sweeps for expired instances.
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on each per-watcher event send. Slow watchers drop events.
const SEND_EVENT_TIMEOUT: Duration = Duration::from_millis(10);

/// Buffered events per watcher.
const WATCHER_BUFFER: usize = 1;

/// The stored form of one instance, with liveness bookkeeping.
struct InstanceEntry {
    instance: Instance,
    ttl: Option<Duration>,
    last_seen: Instant,
}

impl InstanceEntry {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.last_seen) > ttl,
            None => false,
        }
    }
}

/// The stored form of an [`App`] version.
struct Record {
    name: String,
    version: String,
    metadata: HashMap<String, String>,
    instances: HashMap<String, InstanceEntry>,
    endpoints: Vec<Endpoint>,
}

/// name → version → record.
type Apps = HashMap<String, HashMap<String, Record>>;

struct WatcherHandle {
    tx: mpsc::Sender<Event>,
    signal: Arc<WatcherSignal>,
}

/// Everything guarded by the table lock.
struct TableState {
    /// domain → app name → version → record.
    records: HashMap<String, Apps>,
    watchers: HashMap<Uuid, WatcherHandle>,
}

/// In-memory [`Registry`] implementation.
///
/// Background tasks (pruner and watcher fan-out) start lazily on first
/// use and are aborted when the registry is dropped.
pub struct MemoryRegistry {
    state: Arc<RwLock<TableState>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    prune_interval: Duration,
    tasks_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_prune_interval(DEFAULT_PRUNE_INTERVAL)
    }

    /// Create a registry with a custom prune sweep interval.
    pub fn with_prune_interval(prune_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut records = HashMap::new();
        records.insert(DEFAULT_DOMAIN.to_string(), Apps::new());

        Self {
            state: Arc::new(RwLock::new(TableState {
                records,
                watchers: HashMap::new(),
            })),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            prune_interval,
            tasks_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the pruner and fan-out tasks once, on first use.
    fn ensure_tasks(&self) {
        if self.tasks_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");

        let state = Arc::clone(&self.state);
        let interval = self.prune_interval;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                Self::prune(&state).await;
            }
        }));

        let state = Arc::clone(&self.state);
        let rx = self
            .events_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take();
        if let Some(mut rx) = rx {
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    Self::fan_out(&state, event).await;
                }
            }));
        }
    }

    /// Remove every instance whose TTL elapsed. Expiry is silent
    /// housekeeping: no watcher events are emitted here.
    async fn prune(state: &RwLock<TableState>) {
        let now = Instant::now();
        let mut state = state.write().await;

        for (domain, apps) in state.records.iter_mut() {
            for (name, versions) in apps.iter_mut() {
                for record in versions.values_mut() {
                    record.instances.retain(|id, entry| {
                        let keep = !entry.expired(now);
                        if !keep {
                            debug!(
                                app = %name,
                                instance = %id,
                                domain = %domain,
                                "Instance TTL expired"
                            );
                        }
                        keep
                    });
                }
            }
        }
    }

    /// Deliver one event to every live watcher, bounded per send.
    async fn fan_out(state: &RwLock<TableState>, event: Event) {
        let handles: Vec<(Uuid, mpsc::Sender<Event>, Arc<WatcherSignal>)> = {
            let state = state.read().await;
            state
                .watchers
                .iter()
                .map(|(id, h)| (*id, h.tx.clone(), Arc::clone(&h.signal)))
                .collect()
        };

        let mut stale = Vec::new();
        for (id, tx, signal) in handles {
            if signal.is_stopped() {
                stale.push(id);
                continue;
            }

            match tokio::time::timeout(SEND_EVENT_TIMEOUT, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                // Receiver gone: evict the watcher.
                Ok(Err(_)) => stale.push(id),
                // Slow watcher: the event is dropped, never back-pressured.
                Err(_) => {}
            }
        }

        if !stale.is_empty() {
            let mut state = state.write().await;
            for id in stale {
                state.watchers.remove(&id);
            }
        }
    }

    fn emit(&self, kind: EventKind, app: App) {
        // Unbounded send under the write lock preserves emission order.
        let _ = self.events_tx.send(Event { kind, app });
    }

    fn resolve_domain(domain: &str) -> &str {
        if domain.is_empty() {
            DEFAULT_DOMAIN
        } else {
            domain
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

/// Build the stored record for an app, deep-copying metadata and
/// stamping the domain into every instance.
fn app_to_record(app: &App, domain: &str, ttl: Option<Duration>) -> Record {
    let now = Instant::now();
    let instances = app
        .instances
        .iter()
        .map(|instance| {
            (
                instance.id.clone(),
                InstanceEntry {
                    instance: stamped_instance(instance, domain),
                    ttl,
                    last_seen: now,
                },
            )
        })
        .collect();

    Record {
        name: app.name.clone(),
        version: app.version.clone(),
        metadata: app.metadata.clone(),
        instances,
        endpoints: app.endpoints.clone(),
    }
}

/// Snapshot a record back into an [`App`] the caller may freely mutate.
fn record_to_app(record: &Record, domain: &str) -> App {
    let mut metadata = record.metadata.clone();
    metadata.insert(DOMAIN_KEY.to_string(), domain.to_string());

    App {
        name: record.name.clone(),
        version: record.version.clone(),
        metadata,
        instances: record
            .instances
            .values()
            .map(|entry| entry.instance.clone())
            .collect(),
        endpoints: record.endpoints.clone(),
    }
}

fn stamped_instance(instance: &Instance, domain: &str) -> Instance {
    let mut metadata = instance.metadata.clone();
    metadata.insert(DOMAIN_KEY.to_string(), domain.to_string());
    Instance {
        id: instance.id.clone(),
        address: instance.address.clone(),
        metadata,
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn add(&self, app: &App, opts: AddOptions) -> Result<()> {
        self.ensure_tasks();

        let domain = Self::resolve_domain(&opts.domain).to_string();

        // The domain rides in the metadata so watchers can recover it.
        let mut event_app = app.clone();
        event_app
            .metadata
            .insert(DOMAIN_KEY.to_string(), domain.clone());

        let mut state = self.state.write().await;

        let apps = state.records.entry(domain.clone()).or_default();
        let versions = apps.entry(app.name.clone()).or_default();

        let mut created = false;
        if !versions.contains_key(&app.version) {
            versions.insert(
                app.version.clone(),
                app_to_record(&event_app, &domain, opts.ttl),
            );
            created = true;
            debug!(app = %app.name, version = %app.version, domain = %domain, "Added new app");
        }

        let record = versions
            .get_mut(&app.version)
            .expect("record inserted above");

        let mut added = false;
        for instance in &app.instances {
            if record.instances.contains_key(&instance.id) {
                continue;
            }
            record.instances.insert(
                instance.id.clone(),
                InstanceEntry {
                    instance: stamped_instance(instance, &domain),
                    ttl: opts.ttl,
                    last_seen: Instant::now(),
                },
            );
            added = true;
        }

        if created {
            self.emit(EventKind::Create, event_app.clone());
        }

        if added {
            debug!(app = %app.name, version = %app.version, "Added new instance");
            if !created {
                self.emit(EventKind::Update, event_app);
            }
        } else {
            // Re-registration of known instances refreshes liveness only.
            let now = Instant::now();
            for instance in &app.instances {
                if let Some(entry) = record.instances.get_mut(&instance.id) {
                    entry.ttl = opts.ttl;
                    entry.last_seen = now;
                }
            }
        }

        Ok(())
    }

    async fn remove(&self, app: &App, opts: RemoveOptions) -> Result<()> {
        self.ensure_tasks();

        let domain = Self::resolve_domain(&opts.domain).to_string();

        let mut event_app = app.clone();
        event_app
            .metadata
            .insert(DOMAIN_KEY.to_string(), domain.clone());

        let mut state = self.state.write().await;

        // Nothing to deregister when the domain, app or version is absent.
        let Some(apps) = state.records.get_mut(&domain) else {
            return Ok(());
        };
        let Some(versions) = apps.get_mut(&app.name) else {
            return Ok(());
        };
        let Some(record) = versions.get_mut(&app.version) else {
            return Ok(());
        };

        for instance in &app.instances {
            if record.instances.remove(&instance.id).is_some() {
                debug!(
                    app = %app.name,
                    version = %app.version,
                    instance = %instance.id,
                    "Removed instance"
                );
            }
        }

        if !record.instances.is_empty() {
            self.emit(EventKind::Update, event_app);
            return Ok(());
        }

        if versions.len() == 1 {
            // Last version of the app: drop the whole entry.
            apps.remove(&app.name);
            debug!(app = %app.name, domain = %domain, "Removed app");
        } else {
            versions.remove(&app.version);
            debug!(app = %app.name, version = %app.version, domain = %domain, "Removed app version");
        }
        self.emit(EventKind::Delete, event_app);

        Ok(())
    }

    async fn get(&self, name: &str, opts: GetOptions) -> Result<Vec<App>> {
        self.ensure_tasks();

        let domain = Self::resolve_domain(&opts.domain);
        let state = self.state.read().await;

        if domain == WILDCARD_DOMAIN {
            let mut result = Vec::new();
            for (domain, apps) in &state.records {
                if let Some(versions) = apps.get(name) {
                    result.extend(versions.values().map(|r| record_to_app(r, domain)));
                }
            }
            if result.is_empty() {
                return Err(RegistryError::NotFound);
            }
            return Ok(result);
        }

        let versions = state
            .records
            .get(domain)
            .and_then(|apps| apps.get(name))
            .filter(|versions| !versions.is_empty())
            .ok_or(RegistryError::NotFound)?;

        Ok(versions
            .values()
            .map(|r| record_to_app(r, domain))
            .collect())
    }

    async fn list(&self, opts: ListOptions) -> Result<Vec<App>> {
        self.ensure_tasks();

        let domain = Self::resolve_domain(&opts.domain);
        let state = self.state.read().await;

        if domain == WILDCARD_DOMAIN {
            let mut result = Vec::new();
            for (domain, apps) in &state.records {
                for versions in apps.values() {
                    result.extend(versions.values().map(|r| record_to_app(r, domain)));
                }
            }
            return Ok(result);
        }

        let Some(apps) = state.records.get(domain) else {
            return Ok(Vec::new());
        };

        // Each version counts as an individual app.
        let mut result = Vec::new();
        for versions in apps.values() {
            result.extend(versions.values().map(|r| record_to_app(r, domain)));
        }
        Ok(result)
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Watcher> {
        self.ensure_tasks();

        let mut opts = opts;
        if opts.domain.is_empty() {
            opts.domain = DEFAULT_DOMAIN.to_string();
        }

        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        let signal = Arc::new(WatcherSignal::default());
        let watcher = Watcher::new(opts, rx, Arc::clone(&signal));

        let mut state = self.state.write().await;
        state
            .watchers
            .insert(watcher.id(), WatcherHandle { tx, signal });

        Ok(watcher)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
