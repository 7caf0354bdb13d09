//! Kubernetes registry backed by `EndpointSlice` listings.
//!
//! Each lookup lists the `EndpointSlice` resources of a service and returns
//! its ready endpoints. Readiness filtering happens here, so the cache only
//! ever sees addresses Kubernetes considers able to serve traffic.
//!
//! # How It Works
//!
//! 1. Lists `EndpointSlice` resources labelled `kubernetes.io/service-name=<service>`
//! 2. Resolves the configured port by number, or by name from each slice
//! 3. Keeps ready endpoint addresses (an unset condition counts as ready)
//! 4. Names each endpoint after the pod it targets, so ids survive refreshes
//!
//! # Example
//!
//! ```ignore
//! use tonic_lb_cache::{AddressCache, CacheConfig, KubernetesRegistry};
//!
//! let registry = KubernetesRegistry::try_default("grpc").await?.namespace("backend");
//! let cache = AddressCache::new(registry, CacheConfig::default());
//!
//! let endpoints = cache.get_addresses("my-grpc-service", false).await?;
//! ```

use std::net::IpAddr;

use k8s_openapi::api::discovery::v1::{Endpoint as SliceEndpoint, EndpointSlice};
use kube::api::ListParams;
use kube::{Api, Client};

use crate::endpoint::Endpoint;
use crate::error::BoxError;
use crate::registry::Registry;

/// Port specification for the target service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (resolved from `EndpointSlice`).
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Registry that resolves services from Kubernetes `EndpointSlice`s.
///
/// Requires RBAC permission to list `EndpointSlice` resources in the
/// namespace.
#[derive(Clone)]
pub struct KubernetesRegistry {
    client: Client,
    namespace: String,
    port: Port,
}

impl KubernetesRegistry {
    /// Creates a registry using `client`'s default namespace.
    ///
    /// The port can be specified as a number (`50051`) or a name (`"grpc"`).
    #[must_use]
    pub fn new(client: Client, port: impl Into<Port>) -> Self {
        let namespace = client.default_namespace().to_string();

        Self {
            client,
            namespace,
            port: port.into(),
        }
    }

    /// Creates a registry from the in-cluster or kubeconfig environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no Kubernetes client configuration can be loaded.
    pub async fn try_default(port: impl Into<Port>) -> Result<Self, BoxError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, port))
    }

    /// Sets an explicit namespace for the services.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

impl Registry for KubernetesRegistry {
    async fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, BoxError> {
        let slices: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &self.namespace);
        let label_selector = format!("kubernetes.io/service-name={service}");
        let list = slices.list(&ListParams::default().labels(&label_selector)).await?;

        let endpoints: Vec<Endpoint> = list
            .items
            .iter()
            .flat_map(|slice| extract_ready_endpoints(slice, &self.port))
            .collect();

        tracing::debug!(
            "Kubernetes lookup: {} ready endpoints for {}/{service} on port {:?}",
            endpoints.len(),
            self.namespace,
            self.port
        );

        Ok(endpoints)
    }
}

/// Extracts ready endpoints from an `EndpointSlice`.
fn extract_ready_endpoints(slice: &EndpointSlice, port: &Port) -> Vec<Endpoint> {
    let port_number = match port {
        Port::Number(n) => Some(*n),
        Port::Name(name) => slice.ports.as_ref().and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .and_then(|p| p.port)
                .and_then(|p| u16::try_from(p).ok())
        }),
    };

    let Some(port_number) = port_number else {
        return Vec::new();
    };

    let mut endpoints = Vec::new();

    for ep in &slice.endpoints {
        // An endpoint is ready if conditions.ready is true or unset (defaults to true)
        let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);

        if !ready {
            continue;
        }

        let ips: Vec<IpAddr> = ep.addresses.iter().filter_map(|a| a.parse().ok()).collect();
        let instance = instance_name(ep);
        let tags = topology_tags(ep);

        for ip in &ips {
            let id = match &instance {
                Some(name) if ips.len() == 1 => name.clone(),
                Some(name) => format!("{name}/{ip}"),
                None => ip.to_string(),
            };

            endpoints.push(Endpoint::new(id, ip.to_string(), port_number).with_tags(tags.clone()));
        }
    }

    endpoints
}

/// Stable name of the instance behind an endpoint: its pod, else its hostname.
fn instance_name(ep: &SliceEndpoint) -> Option<String> {
    ep.target_ref
        .as_ref()
        .and_then(|r| r.name.clone().or_else(|| r.uid.clone()))
        .or_else(|| ep.hostname.clone())
}

fn topology_tags(ep: &SliceEndpoint) -> Vec<String> {
    let zone = ep.zone.as_ref().map(|zone| format!("zone:{zone}"));
    let node = ep.node_name.as_ref().map(|node| format!("node:{node}"));

    zone.into_iter().chain(node).collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::api::discovery::v1::{EndpointConditions, EndpointPort};

    use super::*;

    // Port conversion tests

    #[test]
    fn port_from_u16() {
        let port: Port = 50051_u16.into();
        assert_eq!(port, Port::Number(50051));
    }

    #[test]
    fn port_from_str() {
        let port: Port = "grpc".into();
        assert_eq!(port, Port::Name("grpc".to_string()));
    }

    // Helper to create an endpoint with addresses and optional ready condition
    fn make_endpoint(addresses: Vec<&str>, ready: Option<bool>) -> SliceEndpoint {
        SliceEndpoint {
            addresses: addresses.into_iter().map(String::from).collect(),
            conditions: Some(EndpointConditions {
                ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // Helper to create an endpoint targeting a named pod
    fn make_pod_endpoint(pod: &str, addresses: Vec<&str>) -> SliceEndpoint {
        SliceEndpoint {
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..make_endpoint(addresses, Some(true))
        }
    }

    // Helper to create an endpoint port
    fn make_port(name: Option<&str>, port: i32) -> EndpointPort {
        EndpointPort {
            name: name.map(String::from),
            port: Some(port),
            ..Default::default()
        }
    }

    fn full_addresses(endpoints: &[Endpoint]) -> Vec<&str> {
        endpoints.iter().map(Endpoint::full_address).collect()
    }

    fn ids(endpoints: &[Endpoint]) -> Vec<&str> {
        endpoints.iter().map(Endpoint::id).collect()
    }

    // extract_ready_endpoints tests

    #[test]
    fn extract_ready_endpoints_empty_slice() {
        let slice = EndpointSlice {
            endpoints: Vec::new(),
            ..Default::default()
        };

        assert!(extract_ready_endpoints(&slice, &Port::Number(50051)).is_empty());
    }

    #[test]
    fn extract_ready_endpoints_with_numeric_port() {
        let slice = EndpointSlice {
            endpoints: vec![make_endpoint(vec!["10.0.0.1", "10.0.0.2"], Some(true))],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(
            full_addresses(&endpoints),
            ["10.0.0.1:50051", "10.0.0.2:50051"]
        );
    }

    #[test]
    fn extract_ready_endpoints_with_named_port() {
        let slice = EndpointSlice {
            endpoints: vec![make_endpoint(vec!["10.0.0.1"], Some(true))],
            ports: Some(vec![
                make_port(Some("http"), 8080),
                make_port(Some("grpc"), 9090),
            ]),
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Name("grpc".to_string()));

        assert_eq!(full_addresses(&endpoints), ["10.0.0.1:9090"]);
    }

    #[test]
    fn extract_ready_endpoints_named_port_not_found() {
        let slice = EndpointSlice {
            endpoints: vec![make_endpoint(vec!["10.0.0.1"], Some(true))],
            ports: Some(vec![make_port(Some("http"), 8080)]),
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Name("grpc".to_string()));
        assert!(endpoints.is_empty());
    }

    #[test]
    fn extract_ready_endpoints_skips_not_ready() {
        let slice = EndpointSlice {
            endpoints: vec![
                make_endpoint(vec!["10.0.0.1"], Some(true)),
                make_endpoint(vec!["10.0.0.2"], Some(false)),
                make_endpoint(vec!["10.0.0.3"], None),
            ],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(
            full_addresses(&endpoints),
            ["10.0.0.1:50051", "10.0.0.3:50051"]
        );
    }

    #[test]
    fn extract_ready_endpoints_no_conditions_defaults_to_ready() {
        let slice = EndpointSlice {
            endpoints: vec![SliceEndpoint {
                addresses: vec!["10.0.0.1".to_string()],
                conditions: None,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(extract_ready_endpoints(&slice, &Port::Number(50051)).len(), 1);
    }

    #[test]
    fn extract_ready_endpoints_skips_invalid_ip() {
        let slice = EndpointSlice {
            endpoints: vec![make_endpoint(vec!["not-an-ip", "10.0.0.1"], Some(true))],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(full_addresses(&endpoints), ["10.0.0.1:50051"]);
    }

    #[test]
    fn extract_ready_endpoints_ipv6() {
        let slice = EndpointSlice {
            endpoints: vec![make_endpoint(vec!["::1", "2001:db8::1"], Some(true))],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(
            full_addresses(&endpoints),
            ["[::1]:50051", "[2001:db8::1]:50051"]
        );
    }

    // Instance identity tests

    #[test]
    fn extract_ready_endpoints_named_after_pod() {
        let slice = EndpointSlice {
            endpoints: vec![
                make_pod_endpoint("api-7d9f-abcde", vec!["10.0.0.1"]),
                make_pod_endpoint("api-7d9f-fghij", vec!["10.0.0.2"]),
            ],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(ids(&endpoints), ["api-7d9f-abcde", "api-7d9f-fghij"]);
    }

    #[test]
    fn extract_ready_endpoints_dual_stack_pod_ids_are_unique() {
        let slice = EndpointSlice {
            endpoints: vec![make_pod_endpoint("api-0", vec!["10.0.0.1", "2001:db8::1"])],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(ids(&endpoints), ["api-0/10.0.0.1", "api-0/2001:db8::1"]);
    }

    #[test]
    fn extract_ready_endpoints_falls_back_to_hostname_then_address() {
        let slice = EndpointSlice {
            endpoints: vec![
                SliceEndpoint {
                    hostname: Some("api-0".to_string()),
                    ..make_endpoint(vec!["10.0.0.1"], Some(true))
                },
                make_endpoint(vec!["10.0.0.2"], Some(true)),
            ],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));

        assert_eq!(ids(&endpoints), ["api-0", "10.0.0.2"]);
    }

    #[test]
    fn extract_ready_endpoints_topology_tags() {
        let slice = EndpointSlice {
            endpoints: vec![SliceEndpoint {
                zone: Some("us-east-1a".to_string()),
                node_name: Some("node-3".to_string()),
                ..make_pod_endpoint("api-0", vec!["10.0.0.1"])
            }],
            ..Default::default()
        };

        let endpoints = extract_ready_endpoints(&slice, &Port::Number(50051));
        let tags = endpoints[0].tags();

        assert_eq!(tags.len(), 2);
        assert!(tags.contains("zone:us-east-1a"));
        assert!(tags.contains("node:node-3"));
    }
}
