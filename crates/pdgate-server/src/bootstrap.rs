//! Bootstrap state machine.
//!
//! `Unbootstrapped` → `Bootstrapped`, once, for the life of the cluster.
//! Every cluster-state operation except `IsBootstrapped` and `Bootstrap`
//! is gated on the `Bootstrapped` phase.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use pdgate_state::{Region, Store};

use crate::cluster::ClusterState;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Unbootstrapped,
    Bootstrapped,
}

/// Tracks the bootstrap phase and serializes the bootstrap transition.
///
/// The phase latches: once `Bootstrapped` is observed (locally or in the
/// cluster state, e.g. bootstrapped through a previous leader) it never
/// reverts.
pub struct BootstrapGate {
    cluster: Arc<dyn ClusterState>,
    phase: RwLock<BootstrapPhase>,
}

impl BootstrapGate {
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self {
            cluster,
            phase: RwLock::new(BootstrapPhase::Unbootstrapped),
        }
    }

    /// Current phase, consulting cluster state while still unbootstrapped.
    pub async fn phase(&self) -> GatewayResult<BootstrapPhase> {
        if *self.phase.read().await == BootstrapPhase::Bootstrapped {
            return Ok(BootstrapPhase::Bootstrapped);
        }
        if self.cluster.is_bootstrapped()? {
            *self.phase.write().await = BootstrapPhase::Bootstrapped;
            debug!("bootstrap observed in cluster state");
            return Ok(BootstrapPhase::Bootstrapped);
        }
        Ok(BootstrapPhase::Unbootstrapped)
    }

    pub async fn is_bootstrapped(&self) -> GatewayResult<bool> {
        Ok(self.phase().await? == BootstrapPhase::Bootstrapped)
    }

    /// Fail with `NotBootstrapped` unless the cluster is bootstrapped.
    pub async fn require_bootstrapped(&self) -> GatewayResult<()> {
        match self.phase().await? {
            BootstrapPhase::Bootstrapped => Ok(()),
            BootstrapPhase::Unbootstrapped => Err(GatewayError::NotBootstrapped),
        }
    }

    /// Run the bootstrap transition.
    ///
    /// Concurrent callers are serialized; exactly one of them performs the
    /// cluster initialization, the rest get `AlreadyBootstrapped`.
    pub async fn bootstrap(&self, store: Store, region: Region) -> GatewayResult<()> {
        let mut phase = self.phase.write().await;
        if *phase == BootstrapPhase::Bootstrapped {
            return Err(GatewayError::AlreadyBootstrapped);
        }

        match self.cluster.bootstrap(store, region) {
            Ok(()) => {
                *phase = BootstrapPhase::Bootstrapped;
                info!("bootstrap phase reached");
                Ok(())
            }
            Err(GatewayError::AlreadyBootstrapped) => {
                *phase = BootstrapPhase::Bootstrapped;
                Err(GatewayError::AlreadyBootstrapped)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BatchIdAllocator;
    use crate::cluster::StoreCluster;
    use pdgate_state::{ClusterStore, Peer};

    fn test_cluster(store: ClusterStore) -> Arc<dyn ClusterState> {
        let ids = Arc::new(BatchIdAllocator::new(store.clone(), 100).unwrap());
        Arc::new(StoreCluster::new(store, ids, 1))
    }

    fn first() -> (Store, Region) {
        (
            Store {
                id: 1,
                address: "127.0.0.1:20160".to_string(),
                ..Default::default()
            },
            Region {
                id: 2,
                peers: vec![Peer { id: 3, store_id: 1 }],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn starts_unbootstrapped() {
        let gate = BootstrapGate::new(test_cluster(ClusterStore::open_in_memory().unwrap()));
        assert_eq!(gate.phase().await.unwrap(), BootstrapPhase::Unbootstrapped);
        assert!(matches!(
            gate.require_bootstrapped().await,
            Err(GatewayError::NotBootstrapped)
        ));
    }

    #[tokio::test]
    async fn bootstrap_once_then_already_bootstrapped() {
        let gate = BootstrapGate::new(test_cluster(ClusterStore::open_in_memory().unwrap()));
        let (store, region) = first();

        gate.bootstrap(store.clone(), region.clone()).await.unwrap();
        assert!(gate.is_bootstrapped().await.unwrap());
        gate.require_bootstrapped().await.unwrap();

        assert!(matches!(
            gate.bootstrap(store, region).await,
            Err(GatewayError::AlreadyBootstrapped)
        ));
    }

    #[tokio::test]
    async fn observes_bootstrap_done_elsewhere() {
        let store = ClusterStore::open_in_memory().unwrap();
        let (s, r) = first();
        test_cluster(store.clone()).bootstrap(s, r).unwrap();

        let gate = BootstrapGate::new(test_cluster(store));
        assert_eq!(gate.phase().await.unwrap(), BootstrapPhase::Bootstrapped);
    }

    #[tokio::test]
    async fn failed_bootstrap_stays_unbootstrapped() {
        let gate = BootstrapGate::new(test_cluster(ClusterStore::open_in_memory().unwrap()));
        let (store, mut region) = first();
        region.peers.clear();

        assert!(gate.bootstrap(store, region).await.is_err());
        assert!(!gate.is_bootstrapped().await.unwrap());
    }
}
