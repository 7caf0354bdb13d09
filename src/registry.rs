//! The registry lookup port and an in-memory implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::error::BoxError;

/// A source of healthy endpoints for a service name.
///
/// Implementations perform a single query per call: no caching and no
/// retries. Only instances currently passing health checks should be
/// returned.
pub trait Registry: Send + Sync + 'static {
    /// Returns the current healthy endpoints of `service`.
    fn lookup(&self, service: &str) -> impl Future<Output = Result<Vec<Endpoint>, BoxError>> + Send;
}

/// Error returned by [`StaticRegistry`] while a failure is injected.
#[derive(Clone, Debug, Error)]
#[error("registry unavailable: {0}")]
pub struct Unavailable(pub String);

/// In-memory registry for tests and local development.
///
/// Clones share state, so a handle kept outside the cache can change what
/// later lookups return.
#[derive(Clone, Debug, Default)]
pub struct StaticRegistry {
    state: Arc<Mutex<StaticState>>,
    lookups: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct StaticState {
    services: HashMap<String, Vec<Endpoint>>,
    failure: Option<String>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the endpoints returned for `service`.
    pub fn set(&self, service: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.state.lock().services.insert(service.into(), endpoints);
    }

    /// Removes `service`; later lookups return no endpoints.
    pub fn remove(&self, service: &str) {
        self.state.lock().services.remove(service);
    }

    /// Makes every lookup fail with `message` until [`heal`](Self::heal) is called.
    pub fn fail(&self, message: impl Into<String>) {
        self.state.lock().failure = Some(message.into());
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        self.state.lock().failure = None;
    }

    /// Number of lookups served so far, failed ones included.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Registry for StaticRegistry {
    async fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, BoxError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();

        if let Some(message) = &state.failure {
            return Err(Unavailable(message.clone()).into());
        }

        Ok(state.services.get(service).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_registry_returns_configured_endpoints() {
        let registry = StaticRegistry::new();
        registry.set("api", vec![Endpoint::new("api-1", "10.0.0.1", 8080)]);

        let endpoints = registry.lookup("api").await.unwrap();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id(), "api-1");
        assert_eq!(registry.lookups(), 1);
    }

    #[tokio::test]
    async fn static_registry_unknown_service_is_empty() {
        let registry = StaticRegistry::new();
        assert!(registry.lookup("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_registry_removed_service_is_empty() {
        let registry = StaticRegistry::new();
        registry.set("api", vec![Endpoint::new("api-1", "10.0.0.1", 8080)]);
        registry.remove("api");

        assert!(registry.lookup("api").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_registry_failure_injection() {
        let registry = StaticRegistry::new();
        registry.set("api", vec![Endpoint::new("api-1", "10.0.0.1", 8080)]);
        registry.fail("consul down");

        let err = registry.lookup("api").await.unwrap_err();
        assert_eq!(err.to_string(), "registry unavailable: consul down");

        registry.heal();
        assert_eq!(registry.lookup("api").await.unwrap().len(), 1);
        assert_eq!(registry.lookups(), 2);
    }

    #[tokio::test]
    async fn static_registry_clones_share_state() {
        let registry = StaticRegistry::new();
        let handle = registry.clone();
        handle.set("api", vec![Endpoint::new("api-1", "10.0.0.1", 8080)]);

        assert_eq!(registry.lookup("api").await.unwrap().len(), 1);
        assert_eq!(handle.lookups(), 1);
    }
}
