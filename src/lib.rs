//! # ctrdisk: container disk data sources
//!
//! ctrdisk resolves a container id to the block device holding the
//! container's filesystem, mounts it locally, and exposes it as a
//! [`DataSource`](storage::DataSource) for bulk tar import/export. When the
//! device is exclusively locked by a running workload, the store finds the
//! workload(s) holding it and reports the disk as unavailable.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ctrdisk::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::load("ctrdisk.toml")?;
//!     let backend = Arc::new(LocalDatastore::from_config(&config));
//!
//!     // Once per process, before any store is built
//!     let op = Operation::new("startup");
//!     let pool = ResourcePool(config.resource_pool.clone());
//!     storage::init(&op, backend.as_ref(), &pool, config).await?;
//!
//!     let store = ContainerStore::new(backend)?;
//!     let source = store.new_data_source(&op, "c0ffee").await?;
//!     let stream = source.export(&op, &FilterSpec::default(), true).await?;
//!     // ... consume the tar stream ...
//!     source.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Locked disks
//!
//! A mount failure is read as "possibly locked". The store then asks the
//! backend which powered-on compute elements reference the disk:
//!
//! - nobody: the disk is [`Unavailable`](error::StoreError::Unavailable);
//! - somebody: reading through the holder is not supported yet, so the disk
//!   is also `Unavailable`.
//!
//! ## Core Components
//!
//! - [`storage`]: resolution, mounting, ownership and data sources
//! - [`archive`]: filtered tar snapshots of a directory tree
//! - [`datastore`]: directory-backed datastores
//! - [`placement`]: host placement policies
//! - [`operation`]: cancellable operation context
//! - [`config`]: storage configuration

#[macro_use]
extern crate log;

pub mod archive;
pub mod config;
pub mod datastore;
pub mod error;
pub mod operation;
pub mod placement;
pub mod storage;

/// Commonly used types and traits.
///
/// ```rust,ignore
/// use ctrdisk::prelude::*;
/// ```
pub mod prelude {
    pub use crate::archive::{ArchiveReader, ArchiveStream, FilterSpec};
    pub use crate::config::StorageConfig;
    pub use crate::datastore::LocalDatastore;
    pub use crate::error::{BackendError, Result, StoreError};
    pub use crate::operation::Operation;
    pub use crate::placement::{Host, HostPolicy, RandomHostPolicy, StaticInventory};
    pub use crate::storage::{
        self,
        address::DeviceAddress,
        backend::{DiskBackend, Holder, PowerState, ResourcePool},
        container::{ContainerStore, MountDataSource},
        mount::{MountLease, MountOperations},
        DataSource, Resolver, Source, Store,
    };
}

pub use error::{Result, StoreError};
pub use storage::container::ContainerStore;
