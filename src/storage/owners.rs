//! Finds the compute elements currently holding a disk.

use std::sync::Arc;

use crate::{
    error::Result,
    operation::Operation,
    storage::{
        address::DeviceAddress,
        backend::{ContainerView, DiskBackend, Holder, HolderFilter},
    },
};

#[derive(Clone)]
pub struct OwnershipResolver {
    backend: Arc<dyn DiskBackend>,
    view: ContainerView,
    scheme: String,
}

impl OwnershipResolver {
    pub fn new(
        backend: Arc<dyn DiskBackend>,
        view: ContainerView,
        scheme: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            view,
            scheme: scheme.into(),
        }
    }

    /// Holders referencing the disk at `address` that satisfy `filter`, in backend order.
    ///
    /// An existing disk nobody holds yields an empty list. Never mutates backend state.
    pub async fn owners(
        &self,
        op: &Operation,
        address: &DeviceAddress,
        filter: &HolderFilter<'_>,
    ) -> Result<Vec<Holder>> {
        let disk = address.datastore_path(&self.scheme)?;
        let users = op
            .child("disk_users")
            .run(self.backend.disk_users(&self.view, &disk))
            .await?;

        let total = users.len();
        let owners: Vec<Holder> = users.into_iter().filter(|h| filter(h)).collect();
        tracing::debug!(
            "storage: owners disk={} referencing={} matching={}",
            disk,
            total,
            owners.len()
        );
        Ok(owners)
    }
}
