//! # Local datastores
//!
//! A [`DiskBackend`] over plain directories, used for development and by the
//! `ctrdisk` binary. Each subdirectory of the root is a datastore; a disk is a
//! directory whose name ends with the disk extension:
//!
//! ```text
//! root/
//! ├── holders.toml
//! └── datastore1/
//!     └── containers/
//!         ├── c0ffee.vmdk/          ← disk contents
//!         └── c0ffee.vmdk.lck       ← present while attached
//! ```
//!
//! Attaching writes the `.lck` marker next to the disk and "mounts" the disk
//! directory in place. `holders.toml` lists the compute elements referencing
//! disks:
//!
//! ```toml
//! [[holder]]
//! name = "vm-c0ffee"
//! power_state = "powered_on"
//! disks = ["[datastore1] containers/c0ffee.vmdk"]
//! ```
//!
//! A disk referenced by a powered-on holder cannot be attached.

use std::{
    fs,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
    config::StorageConfig,
    error::BackendError,
    storage::{
        address::DatastorePath,
        backend::{ContainerView, DiskBackend, Holder, PowerState, ResourcePool},
    },
};

pub const HOLDERS_FILE: &str = "holders.toml";
const LOCK_SUFFIX: &str = ".lck";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderRecord {
    pub name: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub disks: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HoldersFile {
    #[serde(rename = "holder", default)]
    holders: Vec<HolderRecord>,
}

#[derive(Debug, Clone)]
pub struct LocalDatastore {
    root: PathBuf,
    extension: String,
}

impl LocalDatastore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.local.root.clone(), config.disk_extension.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the contents of `disk`.
    pub fn disk_dir(&self, disk: &DatastorePath) -> Result<PathBuf, BackendError> {
        let rel = Path::new(&disk.path);
        let safe = !disk.datastore.contains('/')
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BackendError::Fault(format!("disk path escapes datastore: {disk}")));
        }
        Ok(self.root.join(&disk.datastore).join(rel))
    }

    fn lock_marker(&self, disk: &DatastorePath) -> Result<PathBuf, BackendError> {
        let dir = self.disk_dir(disk)?;
        let mut name = dir.as_os_str().to_os_string();
        name.push(LOCK_SUFFIX);
        Ok(PathBuf::from(name))
    }

    /// Append a holder to `holders.toml`.
    pub fn register_holder(&self, record: HolderRecord) -> io::Result<()> {
        let mut file = read_holders(&self.root)?;
        file.holders.retain(|h| h.name != record.name);
        file.holders.push(record);
        let data = toml::to_string_pretty(&file)
            .map_err(|e| io::Error::other(format!("encode holders: {e}")))?;
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(HOLDERS_FILE), data)
    }

    fn holders_of(&self, disk: &DatastorePath) -> io::Result<Vec<HolderRecord>> {
        let wanted = disk.to_string();
        Ok(read_holders(&self.root)?
            .holders
            .into_iter()
            .filter(|h| h.disks.iter().any(|d| *d == wanted))
            .collect())
    }
}

fn read_holders(root: &Path) -> io::Result<HoldersFile> {
    let path = root.join(HOLDERS_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HoldersFile::default()),
        Err(e) => return Err(e),
    };
    toml::from_str(&content).map_err(|e| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("parse {}: {e}", path.display()),
        )
    })
}

fn find_disks(
    dir: &Path,
    datastore: &str,
    rel: &str,
    extension: &str,
    out: &mut Vec<String>,
) -> io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());
    let suffix = format!(".{extension}");

    for child in children {
        if !child.file_type()?.is_dir() {
            continue;
        }
        let name = child.file_name().to_string_lossy().into_owned();
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        if name.ends_with(&suffix) {
            out.push(DatastorePath::new(datastore, child_rel).to_string());
        } else {
            find_disks(&child.path(), datastore, &child_rel, extension, out)?;
        }
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Fault(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl DiskBackend for LocalDatastore {
    async fn create_container_view(
        &self,
        pool: &ResourcePool,
    ) -> Result<ContainerView, BackendError> {
        if !self.root.is_dir() {
            return Err(BackendError::Fault(format!(
                "datastore root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(ContainerView(format!("{}#{}", self.root.display(), pool.0)))
    }

    async fn list_disks(&self) -> Result<Vec<String>, BackendError> {
        let root = self.root.clone();
        let extension = self.extension.clone();
        blocking(move || {
            let mut datastores: Vec<_> = fs::read_dir(&root)?.collect::<io::Result<_>>()?;
            datastores.sort_by_key(|e| e.file_name());

            let mut out = Vec::new();
            for ds in datastores {
                if !ds.file_type()?.is_dir() {
                    continue;
                }
                let name = ds.file_name().to_string_lossy().into_owned();
                find_disks(&ds.path(), &name, "", &extension, &mut out)?;
            }
            debug!("local: listed {} disks under {}", out.len(), root.display());
            Ok(out)
        })
        .await
    }

    async fn attach_and_mount(&self, disk: &DatastorePath) -> Result<PathBuf, BackendError> {
        let dir = self.disk_dir(disk)?;
        let marker = self.lock_marker(disk)?;
        let this = self.clone();
        let disk = disk.clone();

        // Runs to completion even if the caller stops waiting; an attach
        // nobody receives is rolled back.
        let (tx, rx) = oneshot::channel();
        let rollback = marker.clone();
        let attached = disk.clone();
        tokio::spawn(async move {
            let res = blocking(move || {
                if !dir.is_dir() {
                    return Err(BackendError::Fault(format!("disk not found: {disk}")));
                }
                if let Some(h) = this
                    .holders_of(&disk)?
                    .into_iter()
                    .find(|h| h.power_state == PowerState::PoweredOn)
                {
                    return Err(BackendError::Locked(format!("{disk} is held by {}", h.name)));
                }
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&marker)
                {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        return Err(BackendError::Locked(format!("{disk} is already attached")));
                    }
                    Err(e) => return Err(e.into()),
                }
                info!("local: attached {} at {}", disk, dir.display());
                Ok(dir)
            })
            .await;

            if let Err(Ok(_)) = tx.send(res) {
                warn!("local: attach of {} abandoned by caller, detaching", attached);
                if let Err(e) = tokio::fs::remove_file(&rollback).await {
                    error!("local: rollback of {} failed: {}", attached, e);
                }
            }
        });

        rx.await
            .map_err(|_| BackendError::Fault("attach task dropped".into()))?
    }

    async fn unmount_and_detach(&self, disk: &DatastorePath) -> Result<(), BackendError> {
        let marker = self.lock_marker(disk)?;
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {
                info!("local: detached {}", disk);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("local: detach of {} which is not attached", disk);
                Err(BackendError::Fault(format!("{disk} is not attached")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn disk_users(
        &self,
        _view: &ContainerView,
        disk: &DatastorePath,
    ) -> Result<Vec<Holder>, BackendError> {
        let this = self.clone();
        let disk = disk.clone();
        blocking(move || {
            Ok(this
                .holders_of(&disk)?
                .into_iter()
                .map(|h| Holder::new(h.name, h.power_state))
                .collect())
        })
        .await
    }
}
