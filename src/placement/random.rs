use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{ClusterInventory, Host, HostPolicy};
use crate::{error::Result, operation::Operation};

/// Places compute elements on a uniformly random host.
pub struct RandomHostPolicy {
    inventory: Arc<dyn ClusterInventory>,
    rng: Mutex<StdRng>,
}

impl RandomHostPolicy {
    pub fn new(inventory: Arc<dyn ClusterInventory>) -> Self {
        Self {
            inventory,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic ordering for a given seed.
    pub fn with_seed(inventory: Arc<dyn ClusterInventory>, seed: u64) -> Self {
        Self {
            inventory,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl HostPolicy for RandomHostPolicy {
    fn should_prefer_current_host(&self, _op: &Operation) -> bool {
        false
    }

    async fn recommend(&self, op: &Operation, hosts: Option<Vec<Host>>) -> Result<Vec<Host>> {
        let mut hosts = match hosts {
            Some(hosts) => hosts,
            None => {
                op.child("cluster_hosts")
                    .run(self.inventory.cluster_hosts())
                    .await?
            }
        };

        // Fisher-Yates; every permutation is equally likely.
        hosts.shuffle(&mut *self.rng.lock().unwrap_or_else(|e| e.into_inner()));
        tracing::debug!("placement: random order {:?}", hosts);
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::StaticInventory;

    fn hosts(n: usize) -> Vec<Host> {
        (0..n).map(|i| Host::new(format!("esx-{i:02}"))).collect()
    }

    #[tokio::test]
    async fn test_never_prefers_current_host() {
        let policy = RandomHostPolicy::new(Arc::new(StaticInventory::default()));
        assert!(!policy.should_prefer_current_host(&Operation::new("test")));
    }

    #[tokio::test]
    async fn test_same_seed_same_order() {
        let inv = Arc::new(StaticInventory::new(hosts(8)));
        let a = RandomHostPolicy::with_seed(inv.clone(), 42);
        let b = RandomHostPolicy::with_seed(inv, 42);
        let op = Operation::new("test");
        assert_eq!(
            a.recommend(&op, None).await.unwrap(),
            b.recommend(&op, None).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_inventory_fails() {
        let policy = RandomHostPolicy::new(Arc::new(StaticInventory::default()));
        assert!(policy.recommend(&Operation::new("test"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_candidate_list_is_fine() {
        let policy = RandomHostPolicy::new(Arc::new(StaticInventory::default()));
        let out = policy
            .recommend(&Operation::new("test"), Some(Vec::new()))
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
