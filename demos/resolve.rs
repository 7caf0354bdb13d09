//! Resolves a Kubernetes service through the address cache and hands out
//! round-robin channels, logging every endpoint change along the way.
//!
//! # Running in Kubernetes
//!
//! The demo expects to run inside a Kubernetes cluster (or with a kubeconfig)
//! with permission to list `EndpointSlice` resources for the target service.
//!
//! # Environment Variables
//!
//! - `SERVICE_NAME`: Kubernetes service name (default: greeter-server)
//! - `SERVICE_NAMESPACE`: Kubernetes namespace (default: the client's namespace)
//! - `GRPC_PORT`: gRPC port number or name (default: 50051)
//! - `CACHE_STRATEGY`: maintain-via-poll, timed-eject or always-poll (default: maintain-via-poll)
//! - `CACHE_TTL_SECS`: cache timer interval (default: 5)
//! - `REQUEST_COUNT`: number of selections to make (default: 10)
//! - `REQUEST_INTERVAL_MS`: milliseconds between selections (default: 1000)

use std::env;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tonic_lb_cache::{
    AddressCache, BoxError, CacheConfig, CacheEvent, ChannelFactory, ClientSelector,
    KubernetesRegistry, Port, SelectOptions, SelectorConfig, Strategy,
};
use tracing::{Level, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "greeter-server".to_string());
    let service_namespace = env::var("SERVICE_NAMESPACE").ok();
    let port: Port = match env::var("GRPC_PORT") {
        Ok(value) => value
            .parse::<u16>()
            .map_or_else(|_| Port::from(value), Port::from),
        Err(_) => Port::Number(50051),
    };
    let strategy: Strategy = env::var("CACHE_STRATEGY")
        .ok()
        .map(|s| s.parse::<Strategy>())
        .transpose()?
        .unwrap_or_default();
    let ttl_secs: u64 = env::var("CACHE_TTL_SECS")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or(5);
    let request_count: u32 = env::var("REQUEST_COUNT")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(10);
    let request_interval_ms: u64 = env::var("REQUEST_INTERVAL_MS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(1000);

    info!("Service: {service_name}");
    info!("Port: {port:?}");
    info!("Strategy: {strategy}, TTL: {ttl_secs}s");

    let mut registry = KubernetesRegistry::try_default(port).await?;
    if let Some(ns) = service_namespace {
        registry = registry.namespace(ns);
    }

    let cache = AddressCache::new(
        registry,
        CacheConfig::default()
            .strategy(strategy)
            .ttl(Duration::from_secs(ttl_secs)),
    );

    // Log endpoint changes as the cache observes them
    let mut events = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CacheEvent::Changed { service, endpoints, diff }) => {
                    info!(
                        "{service}: {} endpoints (+{} -{})",
                        endpoints.len(),
                        diff.additions.len(),
                        diff.removals.len()
                    );
                }
                Ok(CacheEvent::Refreshed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!("missed {skipped} cache events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let factory = ChannelFactory::new()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10));
    let selector = ClientSelector::new(cache.clone(), factory, SelectorConfig::default());
    let options = SelectOptions::default();

    for i in 1..=request_count {
        // Channels are built once per endpoint and reused on later selections
        match selector.select_client(&service_name, &options).await {
            Ok(Some(_channel)) => {
                let known = selector.usage(&service_name).map_or(0, |usage| usage.len());
                info!("Selection {i}: channel ready ({known} endpoints in rotation)");
            }
            Ok(None) => warn!("Selection {i}: no endpoint available"),
            Err(e) => error!("Selection {i} failed: {e}"),
        }

        if i < request_count {
            sleep(Duration::from_millis(request_interval_ms)).await;
        }
    }

    cache.stop();
    Ok(())
}
