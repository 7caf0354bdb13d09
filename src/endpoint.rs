//! Resolved service endpoints and change detection between endpoint lists.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv6Addr;

/// One network-reachable instance of a service.
///
/// Identity is the registry-assigned `id`: two endpoints with the same id are
/// the same instance even if their address or port changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    id: String,
    address: String,
    port: u16,
    tags: BTreeSet<String>,
    full_address: String,
}

impl Endpoint {
    /// Creates an endpoint with no tags.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let full_address = host_port(&address, port);

        Self {
            id: id.into(),
            address,
            port,
            tags: BTreeSet::new(),
            full_address,
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// The instance id, unique within its service.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The host address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The instance's tags.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// `address:port`, with IPv6 addresses in brackets.
    #[must_use]
    pub fn full_address(&self) -> &str {
        &self.full_address
    }
}

/// Formats a host and port, bracketing IPv6 literals.
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Keeps the first endpoint seen for each `full_address`, preserving order.
pub(crate) fn dedup_by_address(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::new();

    endpoints
        .into_iter()
        .filter(|ep| seen.insert(ep.full_address.clone()))
        .collect()
}

/// Endpoints added and removed between two refreshes of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointDiff {
    /// Endpoints whose id was not present before.
    pub additions: Vec<Endpoint>,
    /// Endpoints whose id is no longer present.
    pub removals: Vec<Endpoint>,
}

impl EndpointDiff {
    /// Computes the difference between an old and a new endpoint list by id.
    #[must_use]
    pub fn between(old: &[Endpoint], new: &[Endpoint]) -> Self {
        let old_ids: HashSet<&str> = old.iter().map(Endpoint::id).collect();
        let new_ids: HashSet<&str> = new.iter().map(Endpoint::id).collect();

        Self {
            additions: new
                .iter()
                .filter(|ep| !old_ids.contains(ep.id()))
                .cloned()
                .collect(),
            removals: old
                .iter()
                .filter(|ep| !new_ids.contains(ep.id()))
                .cloned()
                .collect(),
        }
    }

    /// Returns `true` if nothing was added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(endpoints: &[Endpoint]) -> Vec<&str> {
        endpoints.iter().map(Endpoint::id).collect()
    }

    #[test]
    fn endpoint_full_address() {
        let ep = Endpoint::new("api-1", "10.0.0.1", 8080);
        assert_eq!(ep.full_address(), "10.0.0.1:8080");
    }

    #[test]
    fn endpoint_full_address_ipv6() {
        let ep = Endpoint::new("api-1", "2001:db8::1", 8080);
        assert_eq!(ep.full_address(), "[2001:db8::1]:8080");
    }

    #[test]
    fn endpoint_full_address_hostname() {
        let ep = Endpoint::new("api-1", "api.internal", 443);
        assert_eq!(ep.full_address(), "api.internal:443");
    }

    #[test]
    fn endpoint_tags_are_a_set() {
        let ep = Endpoint::new("api-1", "10.0.0.1", 8080)
            .with_tag("v1")
            .with_tags(["primary", "v1"]);

        assert_eq!(ep.tags().len(), 2);
        assert!(ep.tags().contains("primary"));
    }

    #[test]
    fn dedup_keeps_first_per_address() {
        let deduped = dedup_by_address(vec![
            Endpoint::new("a", "10.0.0.1", 80),
            Endpoint::new("b", "10.0.0.2", 80),
            Endpoint::new("c", "10.0.0.1", 80),
            Endpoint::new("d", "10.0.0.1", 81),
        ]);

        assert_eq!(ids(&deduped), ["a", "b", "d"]);
    }

    #[test]
    fn diff_additions_and_removals() {
        let old = [
            Endpoint::new("A", "10.0.0.1", 80),
            Endpoint::new("B", "10.0.0.2", 80),
        ];
        let new = [
            Endpoint::new("B", "10.0.0.2", 80),
            Endpoint::new("C", "10.0.0.3", 80),
        ];

        let diff = EndpointDiff::between(&old, &new);

        assert_eq!(ids(&diff.additions), ["C"]);
        assert_eq!(ids(&diff.removals), ["A"]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn diff_identical_ids_is_empty() {
        let old = [
            Endpoint::new("A", "10.0.0.1", 80),
            Endpoint::new("B", "10.0.0.2", 80),
        ];
        let new = [
            Endpoint::new("B", "10.0.0.2", 80),
            Endpoint::new("A", "10.0.0.1", 80),
        ];

        assert!(EndpointDiff::between(&old, &new).is_empty());
    }

    #[test]
    fn diff_ignores_address_changes_for_same_id() {
        let old = [Endpoint::new("A", "10.0.0.1", 80)];
        let new = [Endpoint::new("A", "10.0.0.9", 9090)];

        assert!(EndpointDiff::between(&old, &new).is_empty());
    }

    #[test]
    fn diff_from_empty_adds_everything() {
        let new = [
            Endpoint::new("A", "10.0.0.1", 80),
            Endpoint::new("B", "10.0.0.2", 80),
        ];

        let diff = EndpointDiff::between(&[], &new);

        assert_eq!(ids(&diff.additions), ["A", "B"]);
        assert!(diff.removals.is_empty());
    }
}
