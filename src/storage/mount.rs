//! Mount leases over backend disks.
//!
//! A successful [`MountOperations::mount`] hands back a [`MountLease`]: the
//! local mount path plus a one-shot release action (unmount, then detach).
//! The lease must be released exactly once on every path after the mount
//! succeeded. [`MountLease::release`] consumes the lease, so a second release
//! cannot be expressed; a lease dropped without being released schedules its
//! release on the current tokio runtime.
//!
//! ```rust,ignore
//! let lease = mounter.mount(&op, &address).await?;
//! match inspect(lease.path()).await {
//!     Ok(v) => { lease.release().await; Ok(v) }
//!     Err(e) => { lease.release().await; Err(e) }
//! }
//! ```

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{Result, StoreError},
    operation::Operation,
    storage::{
        address::DeviceAddress,
        backend::{DiskBackend, Holder, PowerState},
    },
};

/// Upper bound on a best-effort unmount/detach.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(120);

type ReleaseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ReleaseFn = Box<dyn FnOnce() -> ReleaseFuture + Send>;

/// A live mount: local path plus its release action.
pub struct MountLease {
    path: PathBuf,
    release: Option<ReleaseFn>,
}

impl MountLease {
    pub fn new<F, Fut>(path: impl Into<PathBuf>, release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            path: path.into(),
            release: Some(Box::new(move || Box::pin(release()) as ReleaseFuture)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the release action. Errors are logged by the action itself.
    pub async fn release(mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }
}

impl fmt::Debug for MountLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountLease")
            .field("path", &self.path)
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    "storage: lease dropped without release, releasing in background path={}",
                    self.path.display()
                );
                handle.spawn(release());
            }
            Err(_) => {
                tracing::error!(
                    "storage: lease dropped outside a runtime, mount leaked path={}",
                    self.path.display()
                );
            }
        }
    }
}

/// Mount and lock capability composed into a store.
#[async_trait]
pub trait MountOperations: Send + Sync {
    /// Attach and mount the disk at `address`. On error no lease exists.
    async fn mount(&self, op: &Operation, address: &DeviceAddress) -> Result<MountLease>;

    /// Whether `holder` is in the state that locks the disks it references.
    fn is_locked(&self, holder: &Holder) -> bool;
}

/// A holder locks its disks while it is powered on.
pub fn locked_disk_filter(holder: &Holder) -> bool {
    holder.power_state == PowerState::PoweredOn
}

/// [`MountOperations`] for datastore-backed virtual disks.
#[derive(Clone)]
pub struct VmdkMounter {
    backend: Arc<dyn DiskBackend>,
    scheme: String,
}

impl VmdkMounter {
    pub fn new(backend: Arc<dyn DiskBackend>, scheme: impl Into<String>) -> Self {
        Self {
            backend,
            scheme: scheme.into(),
        }
    }
}

#[async_trait]
impl MountOperations for VmdkMounter {
    async fn mount(&self, op: &Operation, address: &DeviceAddress) -> Result<MountLease> {
        let disk = address.datastore_path(&self.scheme)?;
        tracing::info!("storage: mount start address={} op={}", address, op.id());

        let mount_path = match op
            .child("attach_and_mount")
            .run(self.backend.attach_and_mount(&disk))
            .await
        {
            Ok(path) => path,
            Err(StoreError::Backend(source)) => {
                return Err(StoreError::Mount {
                    address: address.clone(),
                    source,
                })
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            "storage: mount done address={} path={}",
            address,
            mount_path.display()
        );

        let backend = self.backend.clone();
        let released_path = mount_path.clone();
        Ok(MountLease::new(mount_path, move || async move {
            let op = Operation::new("release").with_timeout(RELEASE_TIMEOUT);
            match op.run(backend.unmount_and_detach(&disk)).await {
                Ok(()) => tracing::info!(
                    "storage: released disk={} path={}",
                    disk,
                    released_path.display()
                ),
                Err(e) => tracing::warn!(
                    "storage: release failed disk={} path={}: {}",
                    disk,
                    released_path.display(),
                    e
                ),
            }
        }))
    }

    fn is_locked(&self, holder: &Holder) -> bool {
        locked_disk_filter(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_lease(counter: Arc<AtomicUsize>) -> MountLease {
        MountLease::new("/mnt/x", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_release_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let lease = counting_lease(counter.clone());
        assert_eq!(lease.path(), Path::new("/mnt/x"));
        lease.release().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counting_lease(counter.clone()));
        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_locked_filter() {
        assert!(locked_disk_filter(&Holder::new("vm", PowerState::PoweredOn)));
        assert!(!locked_disk_filter(&Holder::new("vm", PowerState::PoweredOff)));
        assert!(!locked_disk_filter(&Holder::new("vm", PowerState::Suspended)));
    }
}
