//! The client factory port and the tonic channel factory.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::endpoint::host_port;
use crate::error::BoxError;

/// Where a client should connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTarget {
    /// URL scheme, `http` unless overridden.
    pub scheme: String,
    /// Host name or IP address.
    pub host: String,
    /// Port, or `None` to use the scheme's default.
    pub port: Option<u16>,
    /// Path prefix appended to the authority, empty unless overridden.
    pub path: String,
}

impl ClientTarget {
    /// The target as a URL, e.g. `http://10.0.0.1:8080/api`.
    #[must_use]
    pub fn url(&self) -> String {
        let authority = match self.port {
            Some(port) => host_port(&self.host, port),
            None => self.host.clone(),
        };

        format!("{}://{authority}{}", self.scheme, self.path)
    }
}

/// Builds a network client for a resolved target.
///
/// Implemented for [`ChannelFactory`] and for any
/// `Fn(&ClientTarget) -> Result<C, BoxError>` closure.
pub trait ClientFactory: Send + Sync {
    /// The client type produced. Clones must share the underlying connection.
    type Client: Clone + Send + 'static;

    /// Builds a client for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be turned into a client.
    fn build(&self, target: &ClientTarget) -> Result<Self::Client, BoxError>;
}

impl<F, C> ClientFactory for F
where
    F: Fn(&ClientTarget) -> Result<C, BoxError> + Send + Sync,
    C: Clone + Send + 'static,
{
    type Client = C;

    fn build(&self, target: &ClientTarget) -> Result<C, BoxError> {
        self(target)
    }
}

/// Options used when building a client.
///
/// Unset fields fall back to the service's registered defaults and then to
/// `http` with an empty path and the selector's own factory.
pub struct ClientOptions<C> {
    /// URL scheme.
    pub scheme: Option<String>,
    /// Path prefix.
    pub path: Option<String>,
    /// Factory used instead of the selector's.
    pub factory: Option<Arc<dyn ClientFactory<Client = C>>>,
}

impl<C> Default for ClientOptions<C> {
    fn default() -> Self {
        Self {
            scheme: None,
            path: None,
            factory: None,
        }
    }
}

impl<C> Clone for ClientOptions<C> {
    fn clone(&self) -> Self {
        Self {
            scheme: self.scheme.clone(),
            path: self.path.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<C> fmt::Debug for ClientOptions<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("scheme", &self.scheme)
            .field("path", &self.path)
            .field("factory", &self.factory.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

impl<C> ClientOptions<C> {
    /// Sets the URL scheme.
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    /// Sets the path prefix.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Overrides the factory.
    #[must_use]
    pub fn factory(mut self, factory: impl ClientFactory<Client = C> + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Layers `overrides` on top of these options.
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        Self {
            scheme: overrides.scheme.clone().or_else(|| self.scheme.clone()),
            path: overrides.path.clone().or_else(|| self.path.clone()),
            factory: overrides.factory.clone().or_else(|| self.factory.clone()),
        }
    }

    /// Resolves the target for `host` and `port` under these options.
    #[must_use]
    pub fn target(&self, host: impl Into<String>, port: Option<u16>) -> ClientTarget {
        ClientTarget {
            scheme: self.scheme.clone().unwrap_or_else(|| "http".to_string()),
            host: host.into(),
            port,
            path: self.path.clone().unwrap_or_default(),
        }
    }
}

/// Builds lazily connecting tonic [`Channel`]s.
///
/// No connection is attempted until the first request, so building never
/// blocks. Must be used from within a Tokio runtime.
#[derive(Clone, Debug, Default)]
pub struct ChannelFactory {
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
}

impl ChannelFactory {
    /// Creates a factory with tonic's default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ClientFactory for ChannelFactory {
    type Client = Channel;

    fn build(&self, target: &ClientTarget) -> Result<Channel, BoxError> {
        let mut endpoint = Endpoint::from_shared(target.url())?;

        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }

        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }

        Ok(endpoint.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: Option<u16>) -> ClientTarget {
        ClientOptions::<String>::default().target(host, port)
    }

    #[test]
    fn target_url_defaults() {
        assert_eq!(target("10.0.0.1", Some(8080)).url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn target_url_without_port() {
        assert_eq!(
            target("api.service.consul", None).url(),
            "http://api.service.consul"
        );
    }

    #[test]
    fn target_url_ipv6() {
        assert_eq!(target("::1", Some(50051)).url(), "http://[::1]:50051");
    }

    #[test]
    fn target_url_scheme_and_path() {
        let options = ClientOptions::<String>::default().scheme("https").path("/v1");
        assert_eq!(
            options.target("10.0.0.1", Some(443)).url(),
            "https://10.0.0.1:443/v1"
        );
    }

    #[test]
    fn merged_prefers_overrides() {
        let defaults = ClientOptions::<String>::default().scheme("https").path("/v1");
        let overrides = ClientOptions::default().path("/v2");

        let merged = defaults.merged(&overrides);

        assert_eq!(merged.scheme.as_deref(), Some("https"));
        assert_eq!(merged.path.as_deref(), Some("/v2"));
        assert!(merged.factory.is_none());
    }

    #[test]
    fn merged_keeps_override_factory() {
        let defaults = ClientOptions::<String>::default();
        let overrides = ClientOptions::default()
            .factory(|target: &ClientTarget| Ok::<_, BoxError>(format!("custom {}", target.url())));

        let merged = defaults.merged(&overrides);
        let factory = merged.factory.unwrap();

        assert_eq!(
            factory.build(&target("10.0.0.1", Some(80))).unwrap(),
            "custom http://10.0.0.1:80"
        );
    }

    #[test]
    fn closure_is_a_factory() {
        let factory = |target: &ClientTarget| Ok::<_, BoxError>(target.url());
        assert_eq!(
            factory.build(&target("10.0.0.1", Some(80))).unwrap(),
            "http://10.0.0.1:80"
        );
    }

    #[tokio::test]
    async fn channel_factory_builds_lazy_channel() {
        let factory = ChannelFactory::new()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(2));

        assert!(factory.build(&target("127.0.0.1", Some(50051))).is_ok());
    }

    #[tokio::test]
    async fn channel_factory_rejects_invalid_url() {
        let options = ClientOptions::<Channel>::default().scheme("not a scheme");
        let target = options.target("127.0.0.1", Some(50051));

        assert!(ChannelFactory::new().build(&target).is_err());
    }
}
