//! Host placement policies.
//!
//! A policy answers which hosts are eligible for a new compute element and
//! in what order they should be tried.

mod random;

pub use random::RandomHostPolicy;

use async_trait::async_trait;

use crate::{
    config::ClusterConfig,
    error::{BackendError, Result},
    operation::Operation,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub name: String,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Source of the hosts in the caller's cluster.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn cluster_hosts(&self) -> std::result::Result<Vec<Host>, BackendError>;
}

#[async_trait]
pub trait HostPolicy: Send + Sync {
    /// Whether the host the caller currently runs on should be used as is.
    fn should_prefer_current_host(&self, op: &Operation) -> bool;

    /// Order `hosts`, or all cluster hosts when `None`, by preference.
    async fn recommend(&self, op: &Operation, hosts: Option<Vec<Host>>) -> Result<Vec<Host>>;
}

/// Inventory backed by a fixed host list from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: Vec<Host>,
}

impl StaticInventory {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.hosts.iter().map(Host::new).collect())
    }
}

#[async_trait]
impl ClusterInventory for StaticInventory {
    async fn cluster_hosts(&self) -> std::result::Result<Vec<Host>, BackendError> {
        if self.hosts.is_empty() {
            return Err(BackendError::Fault("cluster has no hosts".into()));
        }
        Ok(self.hosts.clone())
    }
}
