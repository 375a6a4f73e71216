use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Remote coordination store (etcd) connection parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Default: "localhost"
    #[serde(default = "default_host")]
    pub host: String,

    /// Default: 2379
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline applied to every unary call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum number of operations in one transaction.
    /// etcd rejects larger transactions (`--max-txn-ops`, default 128).
    #[serde(default = "default_max_txn_ops")]
    pub max_txn_ops: usize,

    /// Backoff between connection probes while waiting for the channel
    #[serde(default)]
    pub reconnect: BackoffPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_txn_ops: default_max_txn_ops(),
            reconnect: BackoffPolicy::default(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "remote host cannot be empty".into(),
            )));
        }
        if self.max_txn_ops == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_txn_ops must be greater than 0".into(),
            )));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote timeouts must be greater than 0".into(),
            )));
        }
        self.reconnect.validate()
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    2379
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_max_txn_ops() -> usize {
    128
}
