//! Node identity lease configuration
//!
//! ```toml
//! [lease]
//! ttl_secs = 60
//! keep_alive_interval_secs = 45
//! namespace = "/discovery-leases"
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::validate_namespace;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeaseConfig {
    /// Lease time-to-live granted by the remote store (seconds)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// Interval between keep-alive requests (seconds). Must be shorter than
    /// the ttl or the lease expires between renewals.
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    /// Prefix of the lease-pointer keys. The pointer key itself is never
    /// bound to a lease.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            namespace: default_namespace(),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs <= 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "lease ttl_secs must be greater than 0, got {}",
                self.ttl_secs
            ))));
        }
        if self.keep_alive_interval_secs == 0
            || self.keep_alive_interval_secs as i64 >= self.ttl_secs
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "keep_alive_interval_secs must be in 1..{}, got {}",
                self.ttl_secs, self.keep_alive_interval_secs
            ))));
        }
        validate_namespace(&self.namespace, "lease namespace")
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

fn default_ttl_secs() -> i64 {
    60
}
fn default_keep_alive_interval_secs() -> u64 {
    45
}
fn default_namespace() -> String {
    "/discovery-leases".to_string()
}
