//! Endpoint selection and per-endpoint client reuse on top of an [`AddressCache`].
//!
//! Each service gets a usage record holding a flag per endpoint id and the
//! clients built so far. Round-robin walks the candidates in cache order,
//! skipping endpoints already used in the current cycle; once every candidate
//! has been used the flags reset and the cycle starts over.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use futures::future::try_join_all;
use parking_lot::Mutex;
use rand::Rng;

use crate::cache::AddressCache;
use crate::client::{ClientFactory, ClientOptions, ClientTarget};
use crate::endpoint::Endpoint;
use crate::error::{LookupError, ParseError, SelectError};
use crate::registry::Registry;

/// Policy for choosing one endpoint among the candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SelectionStrategy {
    /// Use each candidate once before reusing any.
    #[default]
    RoundRobin,
    /// Pick uniformly at random.
    Random,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
        })
    }
}

impl FromStr for SelectionStrategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(ParseError::new("selection strategy", other)),
        }
    }
}

/// Usage flag of an endpoint within the current round-robin cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    /// Not yet selected in this cycle.
    Eligible,
    /// Selected in this cycle.
    Selected,
}

/// Routes every call for a service through one client bound to a DNS name.
#[derive(Clone, Debug)]
pub struct DnsDelegation {
    /// Appended to the service name to form the host, e.g. `.service.consul`.
    pub suffix: String,
    /// Port to connect to, or `None` for the scheme's default.
    pub port: Option<u16>,
}

impl Default for DnsDelegation {
    fn default() -> Self {
        Self {
            suffix: ".service.consul".to_string(),
            port: None,
        }
    }
}

impl DnsDelegation {
    /// Creates a delegation using the `.service.consul` suffix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the DNS suffix.
    #[must_use]
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Sets the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn host(&self, service: &str) -> String {
        format!("{service}{}", self.suffix)
    }
}

/// Configuration for a [`ClientSelector`].
#[derive(Clone, Debug, Default)]
pub struct SelectorConfig {
    /// How endpoints are chosen.
    pub selection: SelectionStrategy,
    /// When set, endpoint selection is bypassed in favor of one DNS-bound
    /// client per service.
    pub dns: Option<DnsDelegation>,
}

impl SelectorConfig {
    /// Sets the selection strategy.
    #[must_use]
    pub fn selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    /// Enables DNS delegation.
    #[must_use]
    pub fn dns_delegation(mut self, dns: DnsDelegation) -> Self {
        self.dns = Some(dns);
        self
    }
}

/// Per-call selection options.
#[derive(Clone, Debug)]
pub struct SelectOptions<C> {
    /// Refresh the service's endpoints before selecting.
    pub force: bool,
    /// `full_address`es that must not be selected.
    pub blacklist: HashSet<String>,
    /// Client options layered over the service's defaults.
    pub client: ClientOptions<C>,
}

impl<C> Default for SelectOptions<C> {
    fn default() -> Self {
        Self {
            force: false,
            blacklist: HashSet::new(),
            client: ClientOptions::default(),
        }
    }
}

impl<C> SelectOptions<C> {
    /// Sets whether to force a refresh.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Excludes an endpoint by its `full_address`.
    #[must_use]
    pub fn blacklist(mut self, full_address: impl Into<String>) -> Self {
        self.blacklist.insert(full_address.into());
        self
    }

    /// Sets the per-call client options.
    #[must_use]
    pub fn client(mut self, client: ClientOptions<C>) -> Self {
        self.client = client;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ClientKey {
    Endpoint(String),
    Dns,
}

struct ServiceUsage<C> {
    usage: HashMap<String, Usage>,
    clients: HashMap<ClientKey, C>,
    defaults: ClientOptions<C>,
}

impl<C> ServiceUsage<C> {
    fn new(defaults: ClientOptions<C>) -> Self {
        Self {
            usage: HashMap::new(),
            clients: HashMap::new(),
            defaults,
        }
    }

    /// Forgets flags and clients of endpoints the cache no longer returns.
    fn retain_known(&mut self, endpoints: &[Endpoint]) {
        let known: HashSet<&str> = endpoints.iter().map(Endpoint::id).collect();

        self.usage.retain(|id, _| known.contains(id.as_str()));
        self.clients.retain(|key, _| match key {
            ClientKey::Endpoint(id) => known.contains(id.as_str()),
            ClientKey::Dns => true,
        });
    }

    /// Picks one of `candidates`, which must not be empty, and flags it used.
    fn choose<'a>(
        &mut self,
        strategy: SelectionStrategy,
        candidates: &[&'a Endpoint],
    ) -> &'a Endpoint {
        for candidate in candidates {
            self.usage
                .entry(candidate.id().to_string())
                .or_insert(Usage::Eligible);
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => candidates
                .iter()
                .copied()
                .find(|ep| self.usage.get(ep.id()) == Some(&Usage::Eligible))
                .unwrap_or_else(|| {
                    for candidate in candidates {
                        self.usage
                            .insert(candidate.id().to_string(), Usage::Eligible);
                    }

                    candidates[0]
                }),

            SelectionStrategy::Random => candidates[rand::rng().random_range(0..candidates.len())],
        };

        self.usage.insert(chosen.id().to_string(), Usage::Selected);
        chosen
    }
}

/// Picks an endpoint per call and hands out a reusable client for it.
pub struct ClientSelector<R, F: ClientFactory> {
    cache: AddressCache<R>,
    factory: F,
    config: SelectorConfig,
    services: Mutex<HashMap<String, ServiceUsage<F::Client>>>,
}

impl<R: Registry, F: ClientFactory> ClientSelector<R, F> {
    /// Creates a selector drawing endpoints from `cache` and building clients with `factory`.
    #[must_use]
    pub fn new(cache: AddressCache<R>, factory: F, config: SelectorConfig) -> Self {
        Self {
            cache,
            factory,
            config,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// The cache endpoints are drawn from.
    #[must_use]
    pub fn cache(&self) -> &AddressCache<R> {
        &self.cache
    }

    /// Starts tracking `service` with `defaults` as its client options.
    ///
    /// Replaces any existing record, dropping its usage flags and cached clients.
    pub fn register_service(&self, service: impl Into<String>, defaults: ClientOptions<F::Client>) {
        let service = service.into();
        tracing::debug!("registering {service} with client options {defaults:?}");
        self.services
            .lock()
            .insert(service, ServiceUsage::new(defaults));
    }

    /// Stops tracking `service`. Returns `false` if it was not tracked.
    pub fn deregister_service(&self, service: &str) -> bool {
        self.services.lock().remove(service).is_some()
    }

    /// Snapshot of the usage flags of `service`'s endpoints.
    #[must_use]
    pub fn usage(&self, service: &str) -> Option<HashMap<String, Usage>> {
        self.services
            .lock()
            .get(service)
            .map(|record| record.usage.clone())
    }

    /// Chooses an endpoint of `service` without building a client.
    ///
    /// Returns `Ok(None)` when no endpoint is available: the cache holds none,
    /// or all of them are blacklisted. Unknown services are registered with
    /// the call's client options as defaults.
    ///
    /// # Errors
    ///
    /// Returns the cache's [`LookupError`] if resolving the service failed.
    pub async fn select_endpoint(
        &self,
        service: &str,
        options: &SelectOptions<F::Client>,
    ) -> Result<Option<Endpoint>, LookupError> {
        let endpoints = self.cache.get_addresses(service, options.force).await?;

        let mut services = self.services.lock();
        let record = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceUsage::new(options.client.clone()));
        record.retain_known(&endpoints);

        let candidates: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|ep| !options.blacklist.contains(ep.full_address()))
            .collect();

        if candidates.is_empty() {
            tracing::debug!("no endpoint available for {service}");
            return Ok(None);
        }

        let chosen = record.choose(self.config.selection, &candidates);
        tracing::trace!("selected {} ({}) for {service}", chosen.id(), chosen.full_address());

        Ok(Some(chosen.clone()))
    }

    /// Returns a client for one endpoint of `service`.
    ///
    /// Clients are built once per endpoint and reused. With DNS delegation
    /// enabled a single client per service is used and the cache is not
    /// consulted. `Ok(None)` means no endpoint is available, see
    /// [`select_endpoint`](Self::select_endpoint).
    ///
    /// # Errors
    ///
    /// Returns [`SelectError::Lookup`] if resolving the service failed and
    /// [`SelectError::Client`] if the factory could not build a client.
    pub async fn select_client(
        &self,
        service: &str,
        options: &SelectOptions<F::Client>,
    ) -> Result<Option<F::Client>, SelectError> {
        if let Some(dns) = &self.config.dns {
            return self.dns_client(service, dns, options).map(Some);
        }

        let Some(endpoint) = self.select_endpoint(service, options).await? else {
            return Ok(None);
        };

        let mut services = self.services.lock();
        let record = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceUsage::new(options.client.clone()));

        let key = ClientKey::Endpoint(endpoint.id().to_string());
        if let Some(client) = record.clients.get(&key) {
            return Ok(Some(client.clone()));
        }

        let merged = record.defaults.merged(&options.client);
        let target = merged.target(endpoint.address(), Some(endpoint.port()));
        let client = self.build(&merged, &target)?;

        tracing::debug!(
            "built client for {service} endpoint {} at {}",
            endpoint.id(),
            target.url()
        );

        record.clients.insert(key, client.clone());
        Ok(Some(client))
    }

    /// Selects a client for each of `services`, in order.
    ///
    /// # Errors
    ///
    /// Fails as a whole with the first [`SelectError`] encountered. Services
    /// with no available endpoint yield `None` and are not errors.
    pub async fn select_clients<S: AsRef<str>>(
        &self,
        services: &[S],
        options: &SelectOptions<F::Client>,
    ) -> Result<Vec<Option<F::Client>>, SelectError> {
        try_join_all(
            services
                .iter()
                .map(|service| self.select_client(service.as_ref(), options)),
        )
        .await
    }

    fn dns_client(
        &self,
        service: &str,
        dns: &DnsDelegation,
        options: &SelectOptions<F::Client>,
    ) -> Result<F::Client, SelectError> {
        let mut services = self.services.lock();
        let record = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceUsage::new(options.client.clone()));

        if let Some(client) = record.clients.get(&ClientKey::Dns) {
            return Ok(client.clone());
        }

        let merged = record.defaults.merged(&options.client);
        let target = merged.target(dns.host(service), dns.port);
        let client = self.build(&merged, &target)?;

        tracing::debug!("built DNS client for {service} at {}", target.url());
        record.clients.insert(ClientKey::Dns, client.clone());
        Ok(client)
    }

    fn build(
        &self,
        options: &ClientOptions<F::Client>,
        target: &ClientTarget,
    ) -> Result<F::Client, SelectError> {
        let built = match &options.factory {
            Some(factory) => factory.build(target),
            None => self.factory.build(target),
        };

        built.map_err(|source| SelectError::Client {
            url: target.url(),
            source,
        })
    }
}
