//! Storage layer configuration.
//!
//! Configuration is read from a TOML file. Every key has a default, so an
//! empty file is a valid configuration:
//!
//! ```toml
//! scheme = "ds"
//! disk_extension = "vmdk"
//! operation_timeout_secs = 60
//! resource_pool = "pool-1"
//!
//! [local]
//! root = "/var/lib/ctrdisk/datastores"
//!
//! [cluster]
//! hosts = ["esx-01", "esx-02"]
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const DEFAULT_SCHEME: &str = "ds";
pub const DEFAULT_DISK_EXTENSION: &str = "vmdk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Scheme tag every device address must carry.
    pub scheme: String,
    /// Extension of disk names within the datastore, without the dot.
    pub disk_extension: String,
    /// Default deadline for CLI operations.
    pub operation_timeout_secs: Option<u64>,
    /// Resource pool whose compute elements are considered as disk holders.
    pub resource_pool: String,
    pub local: LocalConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Root of the directory-backed datastores.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub hosts: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            disk_extension: DEFAULT_DISK_EXTENSION.to_string(),
            operation_timeout_secs: None,
            resource_pool: "default".to_string(),
            local: LocalConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/ctrdisk/datastores"),
        }
    }
}

impl StorageConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StorageConfig =
            toml::from_str(content).map_err(|e| StoreError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.scheme.is_empty() || !self.scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::Config(format!(
                "scheme must be a non-empty alphanumeric tag, got {:?}",
                self.scheme
            )));
        }
        if self.disk_extension.is_empty() || self.disk_extension.contains('.') {
            return Err(StoreError::Config(format!(
                "disk_extension must be non-empty and dot-free, got {:?}",
                self.disk_extension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StorageConfig::from_toml_str("").unwrap();
        assert_eq!(config, StorageConfig::default());
        assert_eq!(config.scheme, "ds");
        assert_eq!(config.disk_extension, "vmdk");
        assert!(config.operation_timeout().is_none());
    }

    #[test]
    fn test_full_config() {
        let config = StorageConfig::from_toml_str(
            r#"
            scheme = "nfs"
            disk_extension = "img"
            operation_timeout_secs = 5
            resource_pool = "vch-pool"

            [local]
            root = "/tmp/ds"

            [cluster]
            hosts = ["a", "b"]
            "#,
        )
        .unwrap();
        assert_eq!(config.scheme, "nfs");
        assert_eq!(config.disk_extension, "img");
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.local.root, PathBuf::from("/tmp/ds"));
        assert_eq!(config.cluster.hosts, vec!["a", "b"]);
    }

    #[test]
    fn test_rejects_bad_extension() {
        let err = StorageConfig::from_toml_str("disk_extension = \".vmdk\"").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let err = StorageConfig::from_toml_str("scheme = \"ds://\"").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = StorageConfig::load("/nonexistent/ctrdisk.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ctrdisk.toml"));
    }
}
