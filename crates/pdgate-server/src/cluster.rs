//! Cluster-state collaborators.
//!
//! The gateway never touches cluster state directly; it goes through
//! [`ClusterState`] (topology reads and writes) and [`Scheduler`]
//! (operator decisions). Both are shared across every connection, so
//! implementations must tolerate concurrent calls.
//!
//! [`StoreCluster`] is the reference `ClusterState` over the redb-backed
//! [`ClusterStore`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use pdgate_state::*;

use crate::alloc::IdAllocator;
use crate::error::{GatewayError, GatewayResult};
use crate::proto;

/// Ids reserved for the two halves of a region split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIds {
    pub new_region_id: RegionId,
    pub new_peer_ids: Vec<PeerId>,
}

/// Synchronized entry points into cluster state.
pub trait ClusterState: Send + Sync {
    fn is_bootstrapped(&self) -> GatewayResult<bool>;

    /// Initialize the cluster with its first store and region.
    fn bootstrap(&self, store: Store, region: Region) -> GatewayResult<()>;

    fn get_store(&self, store_id: StoreId) -> GatewayResult<Option<Store>>;

    fn put_store(&self, store: Store) -> GatewayResult<()>;

    fn handle_store_heartbeat(&self, stats: StoreStats) -> GatewayResult<()>;

    /// Record the latest view of a region.
    fn ingest_region_heartbeat(&self, region: &RegionInfo) -> GatewayResult<()>;

    fn get_region_by_key(&self, key: &[u8]) -> GatewayResult<Option<RegionInfo>>;

    fn get_region_by_id(&self, region_id: RegionId) -> GatewayResult<Option<RegionInfo>>;

    fn ask_split(&self, region: &Region) -> GatewayResult<SplitIds>;

    fn report_split(&self, left: Region, right: Region) -> GatewayResult<()>;

    fn get_config(&self) -> GatewayResult<ClusterConfig>;

    fn put_config(&self, config: ClusterConfig) -> GatewayResult<()>;
}

/// The scheduling-decision path.
///
/// Given a freshly ingested region view, optionally returns one operator
/// instruction to deliver to the region leader's store.
pub trait Scheduler: Send + Sync {
    fn on_region_heartbeat(
        &self,
        region: &RegionInfo,
    ) -> GatewayResult<Option<proto::RegionHeartbeatResponse>>;
}

/// A scheduler that never issues operators.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn on_region_heartbeat(
        &self,
        _region: &RegionInfo,
    ) -> GatewayResult<Option<proto::RegionHeartbeatResponse>> {
        Ok(None)
    }
}

/// [`ClusterState`] over a [`ClusterStore`].
pub struct StoreCluster {
    store: ClusterStore,
    ids: Arc<dyn IdAllocator>,
    cluster_id: u64,
    max_peer_count: u32,
}

impl StoreCluster {
    pub fn new(store: ClusterStore, ids: Arc<dyn IdAllocator>, cluster_id: u64) -> Self {
        Self {
            store,
            ids,
            cluster_id,
            max_peer_count: ClusterConfig::default().max_peer_count,
        }
    }

    /// Set the replica count written into the config at bootstrap.
    pub fn with_max_peer_count(mut self, max_peer_count: u32) -> Self {
        self.max_peer_count = max_peer_count;
        self
    }
}

impl ClusterState for StoreCluster {
    fn is_bootstrapped(&self) -> GatewayResult<bool> {
        Ok(self.store.is_bootstrapped()?)
    }

    fn bootstrap(&self, store: Store, region: Region) -> GatewayResult<()> {
        if store.id == 0 {
            return Err(invalid("bootstrap store id must not be zero"));
        }
        if region.id == 0 {
            return Err(invalid("bootstrap region id must not be zero"));
        }
        let [peer] = region.peers.as_slice() else {
            return Err(invalid("bootstrap region must have exactly one peer"));
        };
        if peer.store_id != store.id {
            return Err(invalid(format!(
                "bootstrap region peer store {} != store {}",
                peer.store_id, store.id
            )));
        }

        let leader = *peer;
        let store_id = store.id;
        let region_id = region.id;
        let config = ClusterConfig {
            cluster_id: self.cluster_id,
            max_peer_count: self.max_peer_count,
        };
        let marker = BootstrapRecord {
            store_id,
            region_id,
            bootstrapped_at: epoch_secs(),
        };
        let record = StoreRecord {
            store,
            stats: None,
            last_heartbeat: 0,
        };
        self.store
            .bootstrap(&record, &RegionInfo::new(region, Some(leader)), &config, &marker)?;

        info!(cluster_id = self.cluster_id, store_id, region_id, "cluster bootstrapped");
        Ok(())
    }

    fn get_store(&self, store_id: StoreId) -> GatewayResult<Option<Store>> {
        Ok(self.store.get_store(store_id)?.map(|r| r.store))
    }

    fn put_store(&self, store: Store) -> GatewayResult<()> {
        if store.id == 0 {
            return Err(invalid("store id must not be zero"));
        }
        let duplicate = self.store.list_stores()?.into_iter().any(|r| {
            r.store.id != store.id && !r.store.is_tombstone() && r.store.address == store.address
        });
        if duplicate {
            return Err(invalid(format!("duplicated store address {}", store.address)));
        }

        let record = match self.store.get_store(store.id)? {
            Some(existing) => StoreRecord { store, ..existing },
            None => StoreRecord {
                store,
                stats: None,
                last_heartbeat: 0,
            },
        };
        self.store.put_store(&record)?;
        Ok(())
    }

    fn handle_store_heartbeat(&self, stats: StoreStats) -> GatewayResult<()> {
        let store_id = stats.store_id;
        let mut record = self
            .store
            .get_store(store_id)?
            .ok_or_else(|| StateError::NotFound(format!("store {store_id}")))?;
        record.stats = Some(stats);
        record.last_heartbeat = epoch_secs();
        self.store.put_store(&record)?;
        debug!(store_id, "store heartbeat recorded");
        Ok(())
    }

    fn ingest_region_heartbeat(&self, region: &RegionInfo) -> GatewayResult<()> {
        if let Some(existing) = self.store.get_region(region.id())? {
            let (old, new) = (existing.region.epoch, region.region.epoch);
            if new.version < old.version || new.conf_ver < old.conf_ver {
                warn!(region_id = region.id(), ?old, ?new, "stale region heartbeat");
                return Err(invalid(format!(
                    "region {} is stale: epoch {new:?} < {old:?}",
                    region.id()
                )));
            }
        }
        self.store.put_region(region)?;
        Ok(())
    }

    fn get_region_by_key(&self, key: &[u8]) -> GatewayResult<Option<RegionInfo>> {
        Ok(self.store.get_region_by_key(key)?)
    }

    fn get_region_by_id(&self, region_id: RegionId) -> GatewayResult<Option<RegionInfo>> {
        Ok(self.store.get_region(region_id)?)
    }

    fn ask_split(&self, region: &Region) -> GatewayResult<SplitIds> {
        let current = self
            .store
            .get_region_by_key(&region.start_key)?
            .ok_or_else(|| invalid(format!("no region covers split key {:?}", region.start_key)))?;

        let new_region_id = self.ids.alloc()?;
        let new_peer_ids = current
            .region
            .peers
            .iter()
            .map(|_| self.ids.alloc())
            .collect::<GatewayResult<Vec<_>>>()?;

        info!(
            region_id = current.id(),
            new_region_id,
            peers = new_peer_ids.len(),
            "split ids allocated"
        );
        Ok(SplitIds {
            new_region_id,
            new_peer_ids,
        })
    }

    fn report_split(&self, left: Region, right: Region) -> GatewayResult<()> {
        if left.id == 0 || right.id == 0 {
            return Err(invalid("split regions must have non-zero ids"));
        }
        if left.end_key != right.start_key {
            return Err(invalid(format!(
                "split regions {} and {} are not adjacent",
                left.id, right.id
            )));
        }

        let leader_of = |region: &Region| -> GatewayResult<Option<Peer>> {
            Ok(self.store.get_region(region.id)?.and_then(|r| r.leader))
        };
        let left_leader = leader_of(&left)?;
        let right_leader = leader_of(&right)?;
        let (left_id, right_id) = (left.id, right.id);

        self.store.put_regions(&[
            RegionInfo::new(left, left_leader),
            RegionInfo::new(right, right_leader),
        ])?;
        info!(left = left_id, right = right_id, "region split reported");
        Ok(())
    }

    fn get_config(&self) -> GatewayResult<ClusterConfig> {
        Ok(self.store.get_config()?.unwrap_or(ClusterConfig {
            cluster_id: self.cluster_id,
            max_peer_count: self.max_peer_count,
        }))
    }

    fn put_config(&self, config: ClusterConfig) -> GatewayResult<()> {
        if config.cluster_id != self.cluster_id {
            return Err(invalid(format!(
                "config cluster id {} != {}",
                config.cluster_id, self.cluster_id
            )));
        }
        if config.max_peer_count == 0 {
            return Err(invalid("max peer count must be positive"));
        }
        self.store.put_config(&config)?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::InvalidRequest(msg.into())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
