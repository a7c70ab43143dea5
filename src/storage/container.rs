//! Container store: resolves container ids to data sources.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    archive::{self, ArchiveReader, ArchiveStream, FilterSpec},
    error::{Result, StoreError},
    operation::Operation,
    storage::{
        address::DeviceAddress,
        backend::{DiskBackend, Holder, HolderFilter},
        locator::DiskLocator,
        mount::{MountLease, MountOperations, VmdkMounter},
        owners::OwnershipResolver,
        DataSource, Resolver, Source, StorageState, Store,
    },
};

/// Data source over a disk mounted on this host.
///
/// Owns the open directory handle and the mount lease. Both are released by
/// [`DataSource::close`], or, failing that, when the source is dropped.
pub struct MountDataSource {
    path: PathBuf,
    inner: Mutex<Option<Mounted>>,
}

struct Mounted {
    dir: Arc<File>,
    lease: Option<MountLease>,
}

impl MountDataSource {
    /// Open `path` and take ownership of `lease`.
    ///
    /// On failure the lease is released before returning.
    pub async fn open(path: impl Into<PathBuf>, lease: Option<MountLease>) -> Result<Self> {
        let path = path.into();
        match File::open(&path) {
            Ok(dir) => Ok(Self {
                path,
                inner: Mutex::new(Some(Mounted {
                    dir: Arc::new(dir),
                    lease,
                })),
            }),
            Err(e) => {
                tracing::warn!(
                    "storage: cannot open mount path={}: {}",
                    path.display(),
                    e
                );
                if let Some(lease) = lease {
                    lease.release().await;
                }
                Err(StoreError::Io(e))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> Result<Arc<File>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .as_ref()
            .map(|m| m.dir.clone())
            .ok_or_else(|| StoreError::Validation("data source is closed".into()))
    }

    async fn release(&self) {
        let mounted = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Mounted { dir, lease }) = mounted {
            drop(dir);
            if let Some(lease) = lease {
                lease.release().await;
            }
        }
    }
}

#[async_trait]
impl DataSource for MountDataSource {
    async fn import(
        &self,
        _op: &Operation,
        _spec: &FilterSpec,
        _data: ArchiveReader,
    ) -> Result<()> {
        Err(StoreError::NotImplemented("import into a mounted disk"))
    }

    async fn export(
        &self,
        op: &Operation,
        spec: &FilterSpec,
        data: bool,
    ) -> Result<ArchiveStream> {
        let dir = self.dir()?;
        let meta = match dir.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(
                    "storage: stat failed on mount path={}, releasing: {}",
                    self.path.display(),
                    e
                );
                drop(dir);
                self.release().await;
                return Err(StoreError::Io(e));
            }
        };
        if !meta.is_dir() {
            return Err(StoreError::Validation(format!(
                "path must be a directory: {}",
                self.path.display()
            )));
        }
        Ok(archive::diff(op, self.path.clone(), spec, data)?)
    }

    fn source(&self) -> Source {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.as_ref() {
            Some(m) => Source::Mounted {
                path: self.path.clone(),
                dir: m.dir.clone(),
            },
            None => Source::Released,
        }
    }

    async fn close(&self) -> Result<()> {
        self.release().await;
        Ok(())
    }
}

/// Store for container disks on a datastore backend.
///
/// Holds no per-call state, so one instance can serve concurrent resolutions.
#[derive(Clone)]
pub struct ContainerStore {
    mounter: Arc<dyn MountOperations>,
    locator: DiskLocator,
    resolver: OwnershipResolver,
}

impl ContainerStore {
    /// Build a store from the state recorded by [`crate::storage::init`].
    pub fn new(backend: Arc<dyn DiskBackend>) -> Result<Self> {
        let state = crate::storage::state()?;
        Ok(Self::with_state(backend, state))
    }

    pub fn with_state(backend: Arc<dyn DiskBackend>, state: &StorageState) -> Self {
        let scheme = state.config.scheme.clone();
        Self {
            mounter: Arc::new(VmdkMounter::new(backend.clone(), scheme.clone())),
            locator: DiskLocator::new(
                backend.clone(),
                scheme.clone(),
                state.config.disk_extension.clone(),
            ),
            resolver: OwnershipResolver::new(backend, state.container_view.clone(), scheme),
        }
    }

    /// Replace the mount capability.
    pub fn with_mounter(mut self, mounter: Arc<dyn MountOperations>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Data source reaching the disk through the workload holding it.
    async fn new_online_data_source(
        &self,
        _op: &Operation,
        holder: &Holder,
    ) -> Result<Box<dyn DataSource>> {
        Err(StoreError::OnlineExportUnsupported {
            holder: holder.name.clone(),
        })
    }
}

#[async_trait]
impl Resolver for ContainerStore {
    async fn url(&self, op: &Operation, id: &str) -> Result<DeviceAddress> {
        self.locator.locate(op, id).await
    }

    async fn owners(
        &self,
        op: &Operation,
        address: &DeviceAddress,
        filter: &HolderFilter<'_>,
    ) -> Result<Vec<Holder>> {
        self.resolver.owners(op, address, filter).await
    }
}

#[async_trait]
impl Store for ContainerStore {
    async fn new_data_source(&self, op: &Operation, id: &str) -> Result<Box<dyn DataSource>> {
        let address = self.url(op, id).await?;

        // Any mount failure is treated as a possible lock; the error itself
        // does not tell a locked disk apart from other faults.
        match self.mounter.mount(op, &address).await {
            Ok(lease) => {
                let path = lease.path().to_path_buf();
                let source = MountDataSource::open(path, Some(lease)).await?;
                tracing::info!(
                    "storage: data source ready id={} path={}",
                    id,
                    source.path().display()
                );
                return Ok(Box::new(source));
            }
            Err(e) => {
                tracing::info!(
                    "storage: mount failed, looking for lock holders id={}: {}",
                    id,
                    e
                );
            }
        }

        let mounter = self.mounter.clone();
        let locked = move |h: &Holder| mounter.is_locked(h);
        let owners = self.owners(op, &address, &locked).await?;
        if owners.is_empty() {
            tracing::warn!("storage: mount failed with no lock holder id={}", id);
            return Err(StoreError::Unavailable { id: id.to_string() });
        }

        for owner in &owners {
            match self.new_online_data_source(op, owner).await {
                Ok(source) => return Ok(source),
                Err(e) => tracing::info!(
                    "storage: no online source id={} holder={}: {}",
                    id,
                    owner.name,
                    e
                ),
            }
        }

        Err(StoreError::Unavailable { id: id.to_string() })
    }
}
