//! The block-storage backend seam.
//!
//! Directory/session management, attach/detach and mount/unmount mechanics
//! live behind [`DiskBackend`]. The core only sequences these calls.

use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::BackendError, storage::address::DatastorePath};

/// Runtime power state of a compute element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot of a compute element referencing a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub name: String,
    pub power_state: PowerState,
}

impl Holder {
    pub fn new(name: impl Into<String>, power_state: PowerState) -> Self {
        Self {
            name: name.into(),
            power_state,
        }
    }
}

/// Predicate over holders, as taken by ownership lookups.
pub type HolderFilter<'a> = dyn Fn(&Holder) -> bool + Sync + 'a;

/// Reference to the resource pool whose compute elements the storage layer watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePool(pub String);

/// Backend-side view over the compute elements of a resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerView(pub String);

#[async_trait]
pub trait DiskBackend: Send + Sync {
    /// Create a view of the compute elements under `pool`.
    async fn create_container_view(
        &self,
        pool: &ResourcePool,
    ) -> Result<ContainerView, BackendError>;

    /// Names of every disk known to the backend, in datastore path notation.
    async fn list_disks(&self) -> Result<Vec<String>, BackendError>;

    /// Attach the disk to this host and mount it, returning the local mount path.
    async fn attach_and_mount(&self, disk: &DatastorePath) -> Result<PathBuf, BackendError>;

    async fn unmount_and_detach(&self, disk: &DatastorePath) -> Result<(), BackendError>;

    /// Compute elements within `view` whose configuration references `disk`.
    async fn disk_users(
        &self,
        view: &ContainerView,
        disk: &DatastorePath,
    ) -> Result<Vec<Holder>, BackendError>;
}
