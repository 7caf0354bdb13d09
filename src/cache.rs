//! Per-service endpoint cache with coalesced refreshes and change notifications.
//!
//! # How It Works
//!
//! 1. The first lookup of a service (or any lookup while its cached list is
//!    empty, forced, or under [`Strategy::AlwaysPoll`]) dispatches a refresh
//! 2. Callers arriving while that refresh is in flight wait on it instead of
//!    querying the registry again
//! 3. When the refresh completes the new list is diffed against the old one by
//!    endpoint id, cached, announced as [`CacheEvent`]s, and handed to every
//!    waiter
//! 4. A per-service timer then applies the strategy: re-poll, eject, or nothing
//!
//! # Example
//!
//! ```ignore
//! use tonic_lb_cache::{AddressCache, CacheConfig, StaticRegistry, Strategy};
//!
//! let cache = AddressCache::new(StaticRegistry::new(), CacheConfig::default());
//! let mut events = cache.subscribe();
//!
//! let endpoints = cache.get_addresses("api", false).await?;
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;

use crate::endpoint::{Endpoint, EndpointDiff, dedup_by_address};
use crate::error::LookupError;
use crate::registry::Registry;
use crate::strategy::{Strategy, TimerAction};

/// A cached endpoint list. Cheap to clone; replaced wholesale on refresh.
pub type Endpoints = Arc<[Endpoint]>;

type Waiter = oneshot::Sender<Result<Endpoints, LookupError>>;

/// Configuration for an [`AddressCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Refresh strategy applied to every service.
    pub strategy: Strategy,

    /// Interval of the per-service timer.
    pub ttl: Duration,

    /// Notifications buffered per subscriber before a slow one starts
    /// missing events.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            ttl: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

impl CacheConfig {
    /// Sets the refresh strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the timer interval.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the per-subscriber notification buffer.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Notification emitted after a successful refresh.
#[derive(Clone, Debug)]
pub enum CacheEvent {
    /// A refresh completed, whether or not anything changed.
    Refreshed {
        /// The refreshed service.
        service: String,
        /// Its current endpoints.
        endpoints: Endpoints,
    },

    /// A refresh added or removed endpoints. Always followed by `Refreshed`.
    Changed {
        /// The changed service.
        service: String,
        /// Its current endpoints.
        endpoints: Endpoints,
        /// What was added and removed, by endpoint id.
        diff: EndpointDiff,
    },
}

impl CacheEvent {
    /// The service this event is about.
    #[must_use]
    pub fn service(&self) -> &str {
        match self {
            Self::Refreshed { service, .. } | Self::Changed { service, .. } => service,
        }
    }

    /// The service's endpoints after the refresh.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        match self {
            Self::Refreshed { endpoints, .. } | Self::Changed { endpoints, .. } => endpoints,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum RefreshState {
    #[default]
    Idle,
    Refreshing,
}

#[derive(Debug)]
struct CacheEntry {
    endpoints: Endpoints,
    state: RefreshState,
    waiters: Vec<Waiter>,
    timer: Option<AbortHandle>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            endpoints: Arc::from(Vec::new()),
            state: RefreshState::Idle,
            waiters: Vec::new(),
            timer: None,
        }
    }
}

/// Caches resolved endpoints per service name.
///
/// Clones share the same cache. All methods that may dispatch a refresh or
/// arm a timer must be called from within a Tokio runtime.
pub struct AddressCache<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for AddressCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<R> {
    registry: R,
    ttl: Duration,
    strategy: Mutex<Strategy>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    events: broadcast::Sender<CacheEvent>,
    stopped: AtomicBool,
}

impl<R: Registry> AddressCache<R> {
    /// Creates a cache backed by `registry`.
    #[must_use]
    pub fn new(registry: R, config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                registry,
                ttl: config.ttl,
                strategy: Mutex::new(config.strategy),
                entries: Mutex::new(HashMap::new()),
                events,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the endpoints of `service`, refreshing from the registry when needed.
    ///
    /// A refresh is dispatched when the service has no cached endpoints, when
    /// the strategy is [`Strategy::AlwaysPoll`], or when `force` is set.
    /// Otherwise the cached list is returned as is, which may be empty. Calls
    /// made while a refresh is in flight share its result.
    ///
    /// # Errors
    ///
    /// Returns the refresh's [`LookupError`] if the registry lookup failed. The
    /// cached list is left untouched in that case.
    pub async fn get_addresses(
        &self,
        service: &str,
        force: bool,
    ) -> Result<Endpoints, LookupError> {
        let strategy = self.inner.strategy();

        let pending = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(service.to_string()).or_default();

            if !needs_dispatch(&entry.endpoints, strategy, force) {
                return Ok(Arc::clone(&entry.endpoints));
            }

            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            self.inner.start_refresh(service, entry);
            rx
        };

        pending
            .await
            .unwrap_or_else(|_| Err(LookupError::Abandoned(service.to_string())))
    }

    /// Returns the cached endpoints of `service` without touching the registry.
    ///
    /// `None` if the service has never been looked up.
    #[must_use]
    pub fn peek(&self, service: &str) -> Option<Endpoints> {
        self.inner
            .entries
            .lock()
            .get(service)
            .map(|entry| Arc::clone(&entry.endpoints))
    }

    /// Subscribes to refresh notifications for all services.
    ///
    /// A subscriber that falls more than the configured capacity behind
    /// observes a lag error and skips ahead; it never holds up the cache.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// The active refresh strategy.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy()
    }

    /// Switches the refresh strategy.
    ///
    /// Timers that are already armed keep running and apply the new strategy
    /// when they fire. Switching to a timer-driven strategy arms a timer for
    /// every idle service that has none.
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.inner.strategy.lock() = strategy;
        tracing::debug!("address cache strategy set to {strategy}");

        if !strategy.arms_timer() {
            return;
        }

        for (service, entry) in self.inner.entries.lock().iter_mut() {
            // In-flight refreshes arm on completion.
            if entry.state == RefreshState::Idle {
                self.inner.arm_timer(service, entry);
            }
        }
    }

    /// The timer interval.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// The registry backing this cache.
    #[must_use]
    pub fn registry(&self) -> &R {
        &self.inner.registry
    }

    /// Cancels all armed timers and stops arming new ones.
    ///
    /// Lookups keep working; refreshes already in flight still complete.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        for entry in self.inner.entries.lock().values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }

        tracing::debug!("address cache stopped");
    }
}

fn needs_dispatch(cached: &[Endpoint], strategy: Strategy, force: bool) -> bool {
    cached.is_empty() || strategy.polls_every_call() || force
}

impl<R: Registry> Inner<R> {
    fn strategy(&self) -> Strategy {
        *self.strategy.lock()
    }

    /// Spawns a refresh for `service` unless one is already in flight.
    fn start_refresh(self: &Arc<Self>, service: &str, entry: &mut CacheEntry) {
        if entry.state == RefreshState::Refreshing {
            return;
        }

        entry.state = RefreshState::Refreshing;
        tracing::trace!("dispatch for {service}");

        let inner = Arc::clone(self);
        let service = service.to_string();

        tokio::spawn(async move {
            let mut in_flight = InFlight {
                inner,
                service,
                done: false,
            };

            let result = in_flight.inner.lookup(&in_flight.service).await;
            in_flight.done = true;
            in_flight.inner.complete(&in_flight.service, result, true);
        });
    }

    async fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, LookupError> {
        let endpoints =
            self.registry
                .lookup(service)
                .await
                .map_err(|source| LookupError::Registry {
                    service: service.to_string(),
                    source: Arc::from(source),
                })?;

        Ok(dedup_by_address(endpoints))
    }

    /// Applies a finished refresh: diff, replace, notify, resolve waiters, rearm.
    fn complete(
        self: &Arc<Self>,
        service: &str,
        result: Result<Vec<Endpoint>, LookupError>,
        rearm: bool,
    ) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(service.to_string()).or_default();
        entry.state = RefreshState::Idle;
        let waiters = mem::take(&mut entry.waiters);

        let outcome = match result {
            Ok(endpoints) => {
                let endpoints: Endpoints = endpoints.into();
                let diff = EndpointDiff::between(&entry.endpoints, &endpoints);
                entry.endpoints = Arc::clone(&endpoints);

                tracing::debug!(
                    "refreshed {service}: {} endpoints ({} added, {} removed)",
                    endpoints.len(),
                    diff.additions.len(),
                    diff.removals.len()
                );

                if !diff.is_empty() {
                    self.emit(CacheEvent::Changed {
                        service: service.to_string(),
                        endpoints: Arc::clone(&endpoints),
                        diff,
                    });
                }

                self.emit(CacheEvent::Refreshed {
                    service: service.to_string(),
                    endpoints: Arc::clone(&endpoints),
                });

                Ok(endpoints)
            }

            Err(err) => {
                if waiters.is_empty() {
                    tracing::error!("background refresh failed: {err}");
                } else {
                    tracing::warn!("refresh failed for {} waiters: {err}", waiters.len());
                }

                Err(err)
            }
        };

        for waiter in waiters {
            // The caller may have given up waiting.
            let _ = waiter.send(outcome.clone());
        }

        if rearm {
            self.arm_timer(service, entry);
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn arm_timer(self: &Arc<Self>, service: &str, entry: &mut CacheEntry) {
        if entry.timer.is_some()
            || self.stopped.load(Ordering::SeqCst)
            || !self.strategy().arms_timer()
        {
            return;
        }

        let cache = Arc::downgrade(self);
        let service = service.to_string();
        let ttl = self.ttl;

        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            if let Some(inner) = cache.upgrade() {
                inner.on_timer(&service);
            }
        });

        entry.timer = Some(task.abort_handle());
    }

    fn on_timer(self: &Arc<Self>, service: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        tracing::trace!("cache timer fired for {service}");
        let action = self.strategy().on_timer();

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(service) else {
            return;
        };

        entry.timer = None;

        match action {
            TimerAction::Refresh => {
                tracing::trace!("firing background lookup for {service}");
                self.start_refresh(service, entry);
            }

            TimerAction::Eject => {
                tracing::trace!("ejecting {service}");
                entry.endpoints = Arc::from(Vec::new());
            }

            TimerAction::Expire => {}
        }
    }
}

impl<R> Drop for Inner<R> {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Resolves a refresh's waiters even if its task is dropped before finishing.
struct InFlight<R: Registry> {
    inner: Arc<Inner<R>>,
    service: String,
    done: bool,
}

impl<R: Registry> Drop for InFlight<R> {
    fn drop(&mut self) {
        if !self.done {
            let abandoned = LookupError::Abandoned(self.service.clone());
            self.inner.complete(&self.service, Err(abandoned), false);
        }
    }
}
