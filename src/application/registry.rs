//! Service registry.
//!
//! Tracks registered instances, their heartbeats and the watchers subscribed
//! to each service name. One `RwLock` guards all three maps so every mutation
//! and the events it emits are applied in a single total order.
//!
//! Watchers receive events through bounded channels fed with `try_send`. A
//! watcher whose buffer is full misses that event; registry mutations never
//! wait on a slow consumer.

use crate::application::heartbeat::{spawn_checker, CheckerHandle};
use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use crate::domain::event::{ServiceEvent, ServiceEventKind};
use crate::domain::health::RegistryHealth;
use crate::domain::service::{HealthStatus, ServiceInfo, ServiceStatus, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid service: {0}")]
    Validation(#[from] ValidationError),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("registry already started")]
    AlreadyStarted,
    #[error("no tokio runtime available")]
    NoRuntime,
    #[error("invalid registry config: {0}")]
    InvalidConfig(String),
}

impl RegistryError {
    /// Errors caused by the request itself rather than by the registry.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, RegistryError::Validation(_) | RegistryError::NotFound(_))
    }
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL given to services registered without one
    pub default_ttl_secs: u64,
    /// How often the heartbeat checker sweeps for expired services
    pub heartbeat_interval_ms: u64,
    /// Buffered events per watcher before new events are dropped
    pub watch_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            heartbeat_interval_ms: 10_000,
            watch_buffer: 100,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.default_ttl_secs == 0 {
            return Err(RegistryError::InvalidConfig(
                "default_ttl_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RegistryError::InvalidConfig(
                "heartbeat_interval_ms must be non-zero".into(),
            ));
        }
        if self.watch_buffer == 0 {
            return Err(RegistryError::InvalidConfig(
                "watch_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    tx: mpsc::Sender<ServiceEvent>,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryState {
    services: HashMap<String, ServiceInfo>,
    /// Monotonic time of the last heartbeat, by service id
    heartbeats: HashMap<String, Instant>,
    /// Watchers by service name
    watchers: HashMap<String, Vec<Watcher>>,
}

#[derive(Debug)]
struct RegistryInner {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    state: RwLock<RegistryState>,
    checker: Mutex<Option<CheckerHandle>>,
    next_watcher_id: AtomicU64,
}

/// Concurrent service registry.
///
/// Cloning is cheap and every clone refers to the same registry. All read
/// paths return owned copies of the stored records.
///
/// Only [`watch`](Self::watch) takes a [`CancellationToken`], because it is
/// the only method whose result outlives the call. Every other method is
/// synchronous, never waits on I/O or on a consumer, and holds the lock only
/// for the map update, so there is nothing for a caller to cancel.
/// [`stop`](Self::stop) is async but bounded by the checker's shutdown.
/// Rate limiter `wait`/`wait_n` take a token for the same reason: they
/// suspend until a permit frees up.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                clock,
                metrics,
                state: RwLock::new(RegistryState::default()),
                checker: Mutex::new(None),
                next_watcher_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Start the background heartbeat checker.
    ///
    /// # Errors
    /// `AlreadyStarted` if the checker is running; `NoRuntime` outside a
    /// Tokio runtime. Neither has side effects.
    pub fn start(&self) -> Result<(), RegistryError> {
        let mut checker = self.inner.checker();
        if checker.is_some() {
            return Err(RegistryError::AlreadyStarted);
        }
        Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval();
        *checker = Some(spawn_checker(
            interval,
            CancellationToken::new(),
            move || match weak.upgrade() {
                Some(inner) => {
                    inner.sweep_expired();
                    true
                }
                None => false,
            },
        ));
        info!(
            heartbeat_interval_ms = self.inner.config.heartbeat_interval_ms,
            "service registry started"
        );
        Ok(())
    }

    /// Stop the heartbeat checker and close every watcher.
    ///
    /// Does nothing if the registry is not running.
    pub async fn stop(&self) {
        let Some(handle) = self.inner.checker().take() else {
            return;
        };
        if let Err(err) = handle.shutdown().await {
            warn!(error = %err, "heartbeat checker did not stop cleanly");
        }

        let mut state = self.inner.write();
        let closed: usize = state.watchers.values().map(Vec::len).sum();
        for watcher in state.watchers.drain().flat_map(|(_, list)| list) {
            watcher.token.cancel();
        }
        info!(watchers_closed = closed, "service registry stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.checker().is_some()
    }

    /// Register or replace a service instance.
    ///
    /// Unset `ttl`, `weight`, `registered_at` and `last_seen` are filled in.
    /// Re-registering an existing id replaces the record and resets its
    /// heartbeat.
    pub fn register(&self, mut service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        service.apply_defaults(self.inner.config.default_ttl_secs);
        let now = self.inner.clock.now();
        let wall = self.inner.clock.utc_now();
        service.registered_at.get_or_insert(wall);
        service.last_seen.get_or_insert(wall);

        let mut state = self.inner.write();
        self.inner.leave_old_name(&mut state, &service);
        state.heartbeats.insert(service.id.clone(), now);
        self.inner
            .emit(&mut state, ServiceEventKind::Register, &service);
        info!(
            service_id = %service.id,
            service_name = %service.name,
            endpoint = %service.endpoint(),
            ttl_secs = service.ttl,
            "service registered"
        );
        state.services.insert(service.id.clone(), service);
        self.inner.metrics.record_registered();
        Ok(())
    }

    /// Remove a service instance.
    pub fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.inner.write();
        let service = state
            .services
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        state.heartbeats.remove(id);
        self.inner
            .emit(&mut state, ServiceEventKind::Deregister, &service);
        self.inner.metrics.record_deregistered();
        info!(service_id = %id, service_name = %service.name, "service deregistered");
        Ok(())
    }

    /// Replace an existing record, keeping its `registered_at`.
    pub fn update(&self, mut service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        service.apply_defaults(self.inner.config.default_ttl_secs);
        let now = self.inner.clock.now();
        let wall = self.inner.clock.utc_now();

        let mut state = self.inner.write();
        let existing = state
            .services
            .get(&service.id)
            .ok_or_else(|| RegistryError::NotFound(service.id.clone()))?;
        service.registered_at = existing.registered_at;
        service.last_seen = Some(wall);

        self.inner.leave_old_name(&mut state, &service);
        state.heartbeats.insert(service.id.clone(), now);
        self.inner.emit(&mut state, ServiceEventKind::Update, &service);
        debug!(service_id = %service.id, service_name = %service.name, "service updated");
        state.services.insert(service.id.clone(), service);
        self.inner.metrics.record_updated();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ServiceInfo, RegistryError> {
        self.inner
            .read()
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// All instances of `name`, in no particular order.
    pub fn list(&self, name: &str) -> Vec<ServiceInfo> {
        self.inner
            .read()
            .services
            .values()
            .filter(|service| service.name == name)
            .cloned()
            .collect()
    }

    /// Every instance, grouped by service name.
    pub fn list_all(&self) -> HashMap<String, Vec<ServiceInfo>> {
        let state = self.inner.read();
        let mut grouped: HashMap<String, Vec<ServiceInfo>> = HashMap::new();
        for service in state.services.values() {
            grouped
                .entry(service.name.clone())
                .or_default()
                .push(service.clone());
        }
        grouped
    }

    /// Active instances of `name` whose heartbeat is within TTL right now.
    ///
    /// Staleness is evaluated at call time, so an instance that expired
    /// since the last sweep is already excluded.
    pub fn healthy(&self, name: &str) -> Vec<ServiceInfo> {
        let now = self.inner.clock.now();
        let state = self.inner.read();
        state
            .services
            .values()
            .filter(|service| service.name == name && state.is_live(service, now))
            .cloned()
            .collect()
    }

    /// Subscribe to future events for `name`.
    ///
    /// The channel closes when `cancel` fires, when the registry stops, or
    /// when the registry is dropped.
    pub fn watch(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ServiceEvent>, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(self.inner.config.watch_buffer);
        let token = cancel.child_token();
        let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .write()
            .watchers
            .entry(name.to_string())
            .or_default()
            .push(Watcher {
                id,
                tx,
                token: token.clone(),
            });
        debug!(service_name = %name, watcher_id = id, "watcher registered");

        let weak = Arc::downgrade(&self.inner);
        let name = name.to_string();
        runtime.spawn(async move {
            token.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.remove_watcher(&name, id);
            }
        });
        Ok(rx)
    }

    /// Record a heartbeat. Touches nothing but `last_seen`.
    pub fn heartbeat(&self, id: &str) -> Result<(), RegistryError> {
        let now = self.inner.clock.now();
        let wall = self.inner.clock.utc_now();
        let mut state = self.inner.write();
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        service.last_seen = Some(wall);
        state.heartbeats.insert(id.to_string(), now);
        self.inner.metrics.record_heartbeat();
        Ok(())
    }

    /// Record a health check result on the service's health descriptor.
    ///
    /// Counts as a heartbeat. A change to `Passing` emits `Healthy`, a change
    /// to `Critical` emits `Unhealthy` and any other change emits `Update`.
    pub fn update_health(&self, id: &str, status: HealthStatus) -> Result<(), RegistryError> {
        let now = self.inner.clock.now();
        let wall = self.inner.clock.utc_now();
        let mut state = self.inner.write();
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let previous = std::mem::replace(&mut service.health.status, status);
        service.last_seen = Some(wall);
        let snapshot = service.clone();
        state.heartbeats.insert(id.to_string(), now);
        self.inner.metrics.record_heartbeat();

        if previous != status {
            let kind = match status {
                HealthStatus::Passing => ServiceEventKind::Healthy,
                HealthStatus::Critical => ServiceEventKind::Unhealthy,
                HealthStatus::Warning | HealthStatus::Unknown => ServiceEventKind::Update,
            };
            self.inner.emit(&mut state, kind, &snapshot);
            info!(service_id = %id, from = %previous, to = %status, "service health changed");
        }
        Ok(())
    }

    /// Change the lifecycle status, e.g. to drain an instance.
    pub fn set_status(&self, id: &str, status: ServiceStatus) -> Result<(), RegistryError> {
        let mut state = self.inner.write();
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if service.status == status {
            return Ok(());
        }
        let previous = std::mem::replace(&mut service.status, status);
        let snapshot = service.clone();
        self.inner.emit(&mut state, ServiceEventKind::Update, &snapshot);
        info!(service_id = %id, from = %previous, to = %status, "service status changed");
        Ok(())
    }

    /// Aggregate health computed from the live state.
    pub fn registry_health(&self) -> RegistryHealth {
        let now = self.inner.clock.now();
        let state = self.inner.read();
        let total = state.services.len();
        let healthy = state
            .services
            .values()
            .filter(|service| state.is_live(service, now))
            .count();
        let names = state
            .services
            .values()
            .map(|service| service.name.as_str())
            .collect::<HashSet<_>>()
            .len();
        let watchers: usize = state.watchers.values().map(Vec::len).sum();
        drop(state);

        RegistryHealth::from_counts(total, healthy)
            .with_detail("service_names", names)
            .with_detail("watchers", watchers)
            .with_detail("heartbeat_checker", if self.is_running() { "running" } else { "stopped" })
    }

    /// Evict every service whose heartbeat is older than its TTL.
    ///
    /// The heartbeat checker calls this on every tick. Returns the number of
    /// evicted services.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().services.contains_key(id)
    }

    /// Ids and service names currently registered.
    pub(crate) fn live_keys(&self) -> (HashSet<String>, HashSet<String>) {
        let state = self.inner.read();
        let ids = state.services.keys().cloned().collect();
        let names = state
            .services
            .values()
            .map(|service| service.name.clone())
            .collect();
        (ids, names)
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().services.is_empty()
    }

    /// Number of open watcher channels across all names.
    pub fn watcher_count(&self) -> usize {
        self.inner.read().watchers.values().map(Vec::len).sum()
    }
}

impl RegistryState {
    fn is_live(&self, service: &ServiceInfo, now: Instant) -> bool {
        service.status == ServiceStatus::Active
            && self.heartbeats.get(&service.id).is_some_and(|last| {
                now.saturating_duration_since(*last) <= service.ttl_duration()
            })
    }
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn checker(&self) -> MutexGuard<'_, Option<CheckerHandle>> {
        self.checker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fan an event out to the watchers of `service.name` without blocking.
    fn emit(&self, state: &mut RegistryState, kind: ServiceEventKind, service: &ServiceInfo) {
        let Some(watchers) = state.watchers.get_mut(&service.name) else {
            return;
        };
        let event = ServiceEvent::new(kind, service.clone(), self.clock.utc_now());

        watchers.retain(|watcher| match watcher.tx.try_send(event.clone()) {
            Ok(()) => {
                self.metrics.record_event_emitted();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_event_dropped();
                warn!(
                    service_name = %service.name,
                    service_id = %service.id,
                    watcher_id = watcher.id,
                    event = %kind,
                    "watcher buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                watcher.token.cancel();
                false
            }
        });

        if watchers.is_empty() {
            state.watchers.remove(&service.name);
        }
    }

    /// Tell watchers of the stored name that `service.id` moved away from it.
    fn leave_old_name(&self, state: &mut RegistryState, service: &ServiceInfo) {
        let previous = match state.services.get(&service.id) {
            Some(previous) if previous.name != service.name => previous.clone(),
            _ => return,
        };
        self.emit(state, ServiceEventKind::Deregister, &previous);
        debug!(
            service_id = %service.id,
            from = %previous.name,
            to = %service.name,
            "service changed name"
        );
    }

    fn remove_watcher(&self, name: &str, id: u64) {
        let mut state = self.write();
        if let Some(watchers) = state.watchers.get_mut(name) {
            watchers.retain(|watcher| watcher.id != id);
            if watchers.is_empty() {
                state.watchers.remove(name);
            }
            debug!(service_name = %name, watcher_id = id, "watcher removed");
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.write();

        let expired: Vec<String> = state
            .services
            .values()
            .filter(|service| {
                state.heartbeats.get(&service.id).map_or(true, |last| {
                    now.saturating_duration_since(*last) > service.ttl_duration()
                })
            })
            .map(|service| service.id.clone())
            .collect();

        for id in &expired {
            state.heartbeats.remove(id);
            if let Some(service) = state.services.remove(id) {
                self.emit(&mut state, ServiceEventKind::Deregister, &service);
                self.metrics.record_evicted();
                warn!(
                    service_id = %id,
                    service_name = %service.name,
                    ttl_secs = service.ttl,
                    "evicting service after missed heartbeats"
                );
            }
        }
        expired.len()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for watcher in state.watchers.values().flatten() {
            watcher.token.cancel();
        }
    }
}
