//! Maps container ids to device addresses.

use std::sync::Arc;

use crate::{
    error::{Result, StoreError},
    operation::Operation,
    storage::{address::DeviceAddress, backend::DiskBackend},
};

/// Finds the disk backing a container by suffix match over the backend listing.
#[derive(Clone)]
pub struct DiskLocator {
    backend: Arc<dyn DiskBackend>,
    scheme: String,
    extension: String,
}

impl DiskLocator {
    pub fn new(
        backend: Arc<dyn DiskBackend>,
        scheme: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            scheme: scheme.into(),
            extension: extension.into(),
        }
    }

    /// Resolve `id` to the address of the disk whose name ends with `<id>.<ext>`.
    ///
    /// Listing errors propagate unchanged. When several disks match, the first
    /// one in listing order wins and the others are logged.
    pub async fn locate(&self, op: &Operation, id: &str) -> Result<DeviceAddress> {
        if id.is_empty() {
            return Err(StoreError::Validation("container id must not be empty".into()));
        }

        let suffix = format!("{}.{}", id, self.extension);
        let disks = op.child("list_disks").run(self.backend.list_disks()).await?;

        let mut matches = disks.into_iter().filter(|name| name.ends_with(&suffix));
        let found = matches.next().ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        let extra: Vec<String> = matches.collect();
        if !extra.is_empty() {
            tracing::warn!(
                "storage: ambiguous disk lookup id={} chosen={} ignored={:?}",
                id,
                found,
                extra
            );
        }

        tracing::debug!("storage: located id={} disk={}", id, found);
        Ok(DeviceAddress::new(self.scheme.clone(), found))
    }
}
