//! # Storage: container disks as data sources
//!
//! The storage layer turns a container id into a [`DataSource`] backed by
//! the container's disk. A disk may be exclusively locked by a running
//! workload, in which case it cannot be mounted here and the layer looks up
//! who holds it instead.
//!
//! ## Key Components
//!
//! - [`locator::DiskLocator`]: id → [`address::DeviceAddress`]
//! - [`mount::MountOperations`]: mount a disk, yielding a [`mount::MountLease`]
//! - [`owners::OwnershipResolver`]: address → holders currently using the disk
//! - [`container::ContainerStore`]: the resolution state machine
//!
//! ## Resolution
//!
//! ```text
//! Resolving ──▶ MountAttempt ──ok──▶ Mounted ──▶ Sourced
//!                    │
//!                  error
//!                    ▼
//!                LockCheck ──no holders──────────▶ Unavailable
//!                    │
//!                 holders ──no online source──▶ Unavailable
//! ```
//!
//! ## Initialization
//!
//! [`init`] must be called once by the host process before any store is
//! created. It records the configuration and builds the backend view of the
//! resource pool's compute elements:
//!
//! ```rust,ignore
//! let op = Operation::new("startup");
//! storage::init(&op, backend.as_ref(), &ResourcePool("vch-pool".into()), config).await?;
//! let store = ContainerStore::new(backend)?;
//! let source = store.new_data_source(&op, "c0ffee").await?;
//! ```

pub mod address;
pub mod backend;
pub mod container;
pub mod locator;
pub mod mount;
pub mod owners;

use std::{fs::File, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;

use crate::{
    archive::{ArchiveReader, ArchiveStream, FilterSpec},
    config::StorageConfig,
    error::{Result, StoreError},
    operation::Operation,
};
use self::{
    address::DeviceAddress,
    backend::{ContainerView, DiskBackend, Holder, HolderFilter, ResourcePool},
};

/// Process-wide storage configuration, set once by [`init`].
#[derive(Debug, Clone)]
pub struct StorageState {
    pub config: StorageConfig,
    pub container_view: ContainerView,
}

static STATE: OnceCell<StorageState> = OnceCell::new();
static INIT_LOCK: Mutex<()> = Mutex::const_new(());

/// Initialize the storage layer.
///
/// The first successful call wins; later calls return `Ok(())` without
/// touching the backend. A failed call leaves the layer uninitialized so the
/// host may retry.
pub async fn init(
    op: &Operation,
    session: &dyn DiskBackend,
    pool: &ResourcePool,
    config: StorageConfig,
) -> Result<()> {
    if STATE.get().is_some() {
        return Ok(());
    }
    let _guard = INIT_LOCK.lock().await;
    if STATE.get().is_some() {
        return Ok(());
    }

    tracing::debug!("storage: decoded config {:?}", config);
    let view = op
        .child("create_container_view")
        .run(session.create_container_view(pool))
        .await?;
    tracing::info!("storage: initialized pool={} view={}", pool.0, view.0);

    let _ = STATE.set(StorageState {
        config,
        container_view: view,
    });
    Ok(())
}

/// The state recorded by [`init`].
pub fn state() -> Result<&'static StorageState> {
    STATE.get().ok_or(StoreError::NotInitialized)
}

/// Maps ids to addresses, and addresses to the holders of that device.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Address of the device backing `id`.
    async fn url(&self, op: &Operation, id: &str) -> Result<DeviceAddress>;

    /// Holders of the device at `address` for which `filter` returns true.
    async fn owners(
        &self,
        op: &Operation,
        address: &DeviceAddress,
        filter: &HolderFilter<'_>,
    ) -> Result<Vec<Holder>>;
}

#[async_trait]
pub trait Store: Resolver {
    async fn new_data_source(&self, op: &Operation, id: &str) -> Result<Box<dyn DataSource>>;
}

/// How a data source reaches its bytes.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Source {
    /// A disk mounted on this host, opened as a directory.
    Mounted { path: PathBuf, dir: Arc<File> },
    /// The source has been closed and no longer exposes a handle.
    Released,
}

/// Bulk import/export of a container filesystem.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Write the archive in `data` into the source.
    async fn import(&self, op: &Operation, spec: &FilterSpec, data: ArchiveReader) -> Result<()>;

    /// Read the source as a tar stream. `data == false` writes headers only.
    ///
    /// The source must stay open until the stream has been consumed.
    async fn export(&self, op: &Operation, spec: &FilterSpec, data: bool)
        -> Result<ArchiveStream>;

    fn source(&self) -> Source;

    /// Release every resource held by the source. Idempotent.
    async fn close(&self) -> Result<()>;
}
