#![allow(dead_code)]

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use ctrdisk::{
    config::StorageConfig,
    error::BackendError,
    storage::{
        address::DatastorePath,
        backend::{ContainerView, DiskBackend, Holder, ResourcePool},
        StorageState,
    },
};

/// In-memory backend whose "mounts" are directories under `mount_root`.
///
/// A disk stays attached until released; attaching it again fails as locked.
/// Releasing removes the mount directory.
pub struct FakeBackend {
    pub disks: Vec<String>,
    pub mount_root: PathBuf,
    pub files: Vec<(String, String)>,
    pub fail_mount: bool,
    pub dangling_mount: bool,
    pub users: Vec<Holder>,
    pub fail_users: bool,
    attached: Mutex<HashSet<String>>,
    pub list_calls: AtomicUsize,
    pub attach_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    pub users_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(mount_root: &Path, disks: &[&str]) -> Self {
        Self {
            disks: disks.iter().map(|d| d.to_string()).collect(),
            mount_root: mount_root.to_path_buf(),
            files: vec![("hello.txt".into(), "hello\n".into())],
            fail_mount: false,
            dangling_mount: false,
            users: Vec::new(),
            fail_users: false,
            attached: Mutex::new(HashSet::new()),
            list_calls: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
            detach_calls: AtomicUsize::new(0),
            users_calls: AtomicUsize::new(0),
        }
    }

    pub fn attaches(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }

    pub fn user_queries(&self) -> usize {
        self.users_calls.load(Ordering::SeqCst)
    }

    pub fn mount_dir(&self, disk: &DatastorePath) -> PathBuf {
        self.mount_root.join(disk.file_name())
    }
}

#[async_trait]
impl DiskBackend for FakeBackend {
    async fn create_container_view(
        &self,
        pool: &ResourcePool,
    ) -> Result<ContainerView, BackendError> {
        Ok(ContainerView(format!("view-{}", pool.0)))
    }

    async fn list_disks(&self) -> Result<Vec<String>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.disks.clone())
    }

    async fn attach_and_mount(&self, disk: &DatastorePath) -> Result<PathBuf, BackendError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mount {
            return Err(BackendError::Fault("attach failed".into()));
        }
        if !self.attached.lock().unwrap().insert(disk.to_string()) {
            return Err(BackendError::Locked(disk.to_string()));
        }
        if self.dangling_mount {
            return Ok(self.mount_root.join("does-not-exist"));
        }
        let dir = self.mount_dir(disk);
        std::fs::create_dir_all(&dir)?;
        for (name, content) in &self.files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(dir)
    }

    async fn unmount_and_detach(&self, disk: &DatastorePath) -> Result<(), BackendError> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        self.attached.lock().unwrap().remove(&disk.to_string());
        let dir = self.mount_dir(disk);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    async fn disk_users(
        &self,
        _view: &ContainerView,
        _disk: &DatastorePath,
    ) -> Result<Vec<Holder>, BackendError> {
        self.users_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_users {
            return Err(BackendError::Fault("inventory unreachable".into()));
        }
        Ok(self.users.clone())
    }
}

pub fn test_state() -> StorageState {
    StorageState {
        config: StorageConfig::default(),
        container_view: ContainerView("view-test".into()),
    }
}

/// One entry of a ustar archive: name, recorded size and content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub name: String,
    pub size: u64,
    pub type_flag: u8,
    pub body: Vec<u8>,
}

/// Minimal ustar reader for asserting on exported archives.
pub fn tar_entries(bytes: &[u8]) -> Vec<TarEntry> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 512 <= bytes.len() {
        let block = &bytes[offset..offset + 512];
        if block.iter().all(|b| *b == 0) {
            break;
        }
        let field = |range: std::ops::Range<usize>| {
            let raw = &block[range];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };
        let name = field(0..100);
        let prefix = field(345..500);
        let name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let size = u64::from_str_radix(field(124..135).trim(), 8).unwrap();
        let start = offset + 512;
        out.push(TarEntry {
            name,
            size,
            type_flag: block[156],
            body: bytes[start..start + size as usize].to_vec(),
        });
        let padded = size.div_ceil(512) * 512;
        offset += 512 + padded as usize;
    }
    out
}

pub fn entry_names(bytes: &[u8]) -> Vec<String> {
    tar_entries(bytes).into_iter().map(|e| e.name).collect()
}
