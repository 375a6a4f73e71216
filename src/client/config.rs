use std::time::Duration;

/// Connection settings of a [`super::DiscoveryClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum time to wait for establishing a TCP connection
    /// Default: 1 second
    pub connect_timeout: Duration,

    /// Maximum time to wait for a complete RPC response
    /// Default: 3 seconds
    pub request_timeout: Duration,

    /// TCP keepalive duration for idle connections
    /// Default: 5 minutes (300s)
    pub tcp_keepalive: Duration,

    /// Enable Gzip compression for registry messages
    /// Default: true (enabled)
    pub enable_compression: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(3000),
            tcp_keepalive: Duration::from_secs(300),
            enable_compression: true,
        }
    }
}
