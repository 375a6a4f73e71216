use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory of the cache database. When unset the caches live in a
    /// temporary database that is removed on shutdown.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.db_path {
            if path.as_os_str().is_empty() {
                return Err(Error::Config(ConfigError::Message(
                    "storage db_path cannot be empty".into(),
                )));
            }
        }
        Ok(())
    }
}
