use std::time::Duration;

use tonic::transport::Endpoint;
use tracing::debug;

use super::ClientConfig;
use super::DiscoveryClient;
use crate::RemoteError;
use crate::Result;

pub struct ClientBuilder {
    config: ClientConfig,
    endpoint: String,
}

impl ClientBuilder {
    /// Create a new builder with default config for one daemon endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::default(),
            endpoint: endpoint.into(),
        }
    }

    /// Set connection timeout (default: 1s)
    pub fn connect_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set request timeout (default: 3s)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Enable/disable compression (default: enabled)
    pub fn enable_compression(
        mut self,
        enable: bool,
    ) -> Self {
        self.config.enable_compression = enable;
        self
    }

    /// Completely replaces the default configuration, discarding settings
    /// made through the individual methods.
    pub fn set_config(
        mut self,
        config: ClientConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Connects to the daemon.
    ///
    /// # Errors
    /// - [`RemoteError::InvalidEndpoint`] for a malformed address
    /// - [`RemoteError::Transport`] when the daemon cannot be reached
    pub async fn build(self) -> Result<DiscoveryClient> {
        debug!(endpoint = %self.endpoint, "connecting to discovery daemon");
        let channel = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| RemoteError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .tcp_keepalive(Some(self.config.tcp_keepalive))
            .connect()
            .await
            .map_err(|e| RemoteError::Transport(Box::new(e)))?;
        Ok(DiscoveryClient::new(channel, &self.config))
    }
}
