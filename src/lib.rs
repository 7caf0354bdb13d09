#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Cached service discovery and per-endpoint client selection for
//! [Tonic](https://docs.rs/tonic) and other network clients.
//!
//! Querying a service registry on every outbound call is slow and couples
//! every request to the registry's availability. This crate keeps the
//! resolved endpoints of each service in an [`AddressCache`], refreshes them
//! according to a [`Strategy`], and tells subscribers when the set of
//! endpoints changes. A [`ClientSelector`] sits on top of the cache, picks one
//! endpoint per call and hands out one reusable client per endpoint.
//!
//! # Features
//!
//! - **Coalesced refreshes**: concurrent lookups of a service share one registry call
//! - **Change notifications**: typed [`CacheEvent`]s with additions and removals by instance id
//! - **Refresh strategies**: background polling, timed ejection, or polling on every call
//! - **Client reuse**: round-robin or random selection with per-call blacklists
//! - **Kubernetes discovery**: ready endpoints from `EndpointSlice`s via [`KubernetesRegistry`]
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use tonic_lb_cache::{
//!     AddressCache, CacheConfig, ChannelFactory, ClientSelector, KubernetesRegistry,
//!     SelectOptions, SelectorConfig,
//! };
//!
//! let registry = KubernetesRegistry::try_default(50051).await?;
//! let cache = AddressCache::new(registry, CacheConfig::default());
//!
//! let factory = ChannelFactory::new().connect_timeout(Duration::from_secs(5));
//! let selector = ClientSelector::new(cache, factory, SelectorConfig::default());
//!
//! // One channel per pod, handed out round-robin
//! let options = SelectOptions::default();
//! if let Some(channel) = selector.select_client("my-grpc-service", &options).await? {
//!     // let client = MyServiceClient::new(channel);
//! }
//! ```

mod cache;
mod client;
mod endpoint;
mod error;
mod k8s;
mod registry;
mod selector;
mod strategy;

pub use cache::{AddressCache, CacheConfig, CacheEvent, Endpoints};
pub use client::{ChannelFactory, ClientFactory, ClientOptions, ClientTarget};
pub use endpoint::{Endpoint, EndpointDiff};
pub use error::{BoxError, LookupError, ParseError, SelectError};
pub use k8s::{KubernetesRegistry, Port};
pub use registry::{Registry, StaticRegistry, Unavailable};
pub use selector::{
    ClientSelector, DnsDelegation, SelectOptions, SelectionStrategy, SelectorConfig, Usage,
};
pub use strategy::Strategy;
