use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::normalize_namespace;
use super::validate_namespace;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiscoverySettings {
    /// Key prefix of every service registration in the remote store
    /// Default: "/discovery"
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Unique name of this daemon. Lease inheritance across restarts only
    /// works when it is stable, so production deployments should set it.
    /// Default: random id per process
    #[serde(default = "default_node_service_name")]
    pub node_service_name: String,

    /// Full reconciliation period (seconds)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            node_service_name: default_node_service_name(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl DiscoverySettings {
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace, "service namespace")?;

        if self.node_service_name.is_empty() || self.node_service_name.contains('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "node_service_name must be non-empty and contain no `/`, got `{}`",
                self.node_service_name
            ))));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sync_interval_secs must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn normalized_namespace(&self) -> String {
        normalize_namespace(&self.namespace)
    }
}

fn default_namespace() -> String {
    "/discovery".to_string()
}
fn default_node_service_name() -> String {
    nanoid::nanoid!()
}
fn default_sync_interval_secs() -> u64 {
    120
}
