//! Client configuration

use crate::client::ClientError;
use std::time::Duration;
use url::Url;

/// Default control URL when neither flag nor environment provides one.
pub const DEFAULT_CONNECT_URL: &str = "ws://localhost:3000/connect";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host of the local origin.
    pub local_host: String,
    /// Port of the local origin.
    pub local_port: u16,
    /// WebSocket URL of the server's control endpoint.
    pub connect_url: String,
    /// Requested subdomain; the server synthesizes one when absent or taken.
    pub subdomain: Option<String>,
    /// Opaque token echoed at handshake.
    pub token: Option<String>,
    /// Overrides the base domain used when deriving the public URL.
    pub domain_base: Option<String>,
    /// Always stream request bodies instead of buffering non-GET bodies.
    pub force_streaming: bool,
    /// Send `accept-encoding: identity` to the origin instead of dropping
    /// the header.
    pub force_identity: bool,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            connect_url: DEFAULT_CONNECT_URL.to_string(),
            subdomain: None,
            token: None,
            domain_base: None,
            force_streaming: false,
            force_identity: false,
            connect_timeout: Duration::from_secs(8),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Base domain for the public URL: the explicit override when present,
    /// otherwise the host component of the control URL.
    pub fn public_base(&self) -> String {
        if let Some(base) = &self.domain_base {
            return base.clone();
        }

        Url::parse(&self.connect_url)
            .ok()
            .and_then(|url| url.host_str().map(|host| host.to_string()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn local_host(mut self, host: String) -> Self {
        self.config.local_host = host;
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn connect_url(mut self, url: String) -> Self {
        self.config.connect_url = url;
        self
    }

    pub fn subdomain(mut self, subdomain: Option<String>) -> Self {
        self.config.subdomain = subdomain;
        self
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.config.token = token;
        self
    }

    pub fn domain_base(mut self, domain_base: Option<String>) -> Self {
        self.config.domain_base = domain_base;
        self
    }

    pub fn force_streaming(mut self, enabled: bool) -> Self {
        self.config.force_streaming = enabled;
        self
    }

    pub fn force_identity(mut self, enabled: bool) -> Self {
        self.config.force_identity = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        if self.config.local_port == 0 {
            return Err(ClientError::Config("local_port is required".to_string()));
        }
        if self.config.connect_url.is_empty() {
            return Err(ClientError::Config("connect_url is required".to_string()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .local_port(3000)
            .subdomain(Some("myapp".to_string()))
            .build()
            .unwrap();

        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.local_port, 3000);
        assert_eq!(config.connect_url, DEFAULT_CONNECT_URL);
    }

    #[test]
    fn test_builder_requires_port() {
        let result = ClientConfig::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_public_base_from_connect_url() {
        let config = ClientConfig::builder()
            .local_port(3000)
            .connect_url("ws://tunnel.example.com:3000/connect".to_string())
            .build()
            .unwrap();

        assert_eq!(config.public_base(), "tunnel.example.com");
    }

    #[test]
    fn test_public_base_override_wins() {
        let config = ClientConfig::builder()
            .local_port(3000)
            .connect_url("ws://10.0.0.5:3000/connect".to_string())
            .domain_base(Some("tunnel.example.com".to_string()))
            .build()
            .unwrap();

        assert_eq!(config.public_base(), "tunnel.example.com");
    }
}
