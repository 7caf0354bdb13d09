//! Error types for lookups, client selection and configuration parsing.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by the registry and client factory ports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A refresh of a service's endpoint list failed.
///
/// Cloneable so that a single failed lookup can be delivered to every caller
/// that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum LookupError {
    /// The registry could not be reached or returned an error.
    #[error("registry lookup for `{service}` failed: {source}")]
    Registry {
        /// The service that was being resolved.
        service: String,
        /// The error reported by the registry.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The refresh task ended without delivering a result.
    #[error("refresh for `{0}` ended without a result")]
    Abandoned(String),
}

impl LookupError {
    /// Returns the service the failed lookup was for.
    #[must_use]
    pub fn service(&self) -> &str {
        match self {
            Self::Registry { service, .. } | Self::Abandoned(service) => service,
        }
    }
}

/// Selecting a client for a service failed.
///
/// An unavailable endpoint is not an error; see
/// [`ClientSelector::select_client`](crate::ClientSelector::select_client).
#[derive(Debug, Error)]
pub enum SelectError {
    /// Resolving the service's endpoints failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The client factory could not build a client for the chosen target.
    #[error("failed to build client for {url}: {source}")]
    Client {
        /// The URL the client was being built for.
        url: String,
        /// The error reported by the factory.
        #[source]
        source: BoxError,
    },
}

/// An option value did not name a known strategy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
