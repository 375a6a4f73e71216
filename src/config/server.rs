use std::net::SocketAddr;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the registry gRPC service listens on
    /// Default: "0.0.0.0:50051"
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Upper bound for draining background tasks on shutdown (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Accept and send gzip compressed registry messages
    #[serde(default = "default_enable_compression")]
    pub enable_compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            enable_compression: default_enable_compression(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.shutdown_grace_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "shutdown_grace_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_address.parse().map_err(|e| {
            Error::Config(ConfigError::Message(format!(
                "invalid bind_address `{}`: {}",
                self.bind_address, e
            )))
        })
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:50051".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_enable_compression() -> bool {
    true
}
