//! Configuration management for the discovery daemon.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`DISCOVERY__SECTION__FIELD`)
//! - Section-wise validation
mod discovery;
mod lease;
mod remote;
mod retry;
mod server;
mod storage;
pub use discovery::*;
pub use lease::*;
pub use remote::*;
pub use retry::*;
pub use server::*;
pub use storage::*;


use std::env;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Main configuration container for the discovery daemon
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DiscoveryConfig {
    /// gRPC listener parameters
    #[serde(default)]
    pub server: ServerConfig,
    /// Remote coordination store connection
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Node identity lease
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Namespaces, node identity and reconciliation cadence
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Cache database location
    #[serde(default)]
    pub storage: StorageConfig,
}

impl DiscoveryConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` once all overrides are applied.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/discovery.toml");
    /// std::env::set_var("DISCOVERY__LEASE__TTL_SECS", "30");
    /// let cfg = DiscoveryConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(Self::environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.server.validate()?;
        self.remote.validate()?;
        self.lease.validate()?;
        self.discovery.validate()?;
        self.storage.validate()?;

        if normalize_namespace(&self.lease.namespace)
            == normalize_namespace(&self.discovery.namespace)
        {
            return Err(Error::Config(ConfigError::Message(
                "lease namespace must differ from the service namespace".into(),
            )));
        }
        Ok(self)
    }

    /// Key under which this node stores its lease id.
    pub fn lease_pointer_key(&self) -> String {
        format!(
            "{}/{}",
            normalize_namespace(&self.lease.namespace),
            self.discovery.node_service_name
        )
    }

    fn environment() -> Environment {
        Environment::with_prefix("DISCOVERY")
            .separator("__")
            .ignore_empty(true)
            .try_parsing(true)
    }
}

/// Strips trailing separators so `/discovery/` and `/discovery` name the same
/// namespace.
pub fn normalize_namespace(namespace: &str) -> String {
    namespace.trim_end_matches('/').to_string()
}

pub(super) fn validate_namespace(
    namespace: &str,
    name: &str,
) -> Result<()> {
    let normalized = normalize_namespace(namespace);
    if !normalized.starts_with('/') || normalized.len() < 2 {
        return Err(Error::Config(ConfigError::Message(format!(
            "{name} must be an absolute key prefix such as `/discovery`, got `{namespace}`"
        ))));
    }
    Ok(())
}
