//! Domain types for the cluster-state store.
//!
//! These types describe the cluster topology the gateway serves: storage
//! nodes (stores), key-range replication units (regions) and the
//! cluster-wide config. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a store.
pub type StoreId = u64;

/// Unique identifier for a region.
pub type RegionId = u64;

/// Unique identifier for a peer (one replica of a region).
pub type PeerId = u64;

// ── Store ──────────────────────────────────────────────────────────

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    /// Decommissioned. Terminal; a tombstoned store accepts no writes.
    Tombstone,
}

/// A storage node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
    pub state: StoreState,
    pub labels: HashMap<String, String>,
}

impl Store {
    pub fn is_tombstone(&self) -> bool {
        self.state == StoreState::Tombstone
    }
}

/// Load statistics reported by a store heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreStats {
    pub store_id: StoreId,
    pub capacity: u64,
    pub available: u64,
    pub region_count: u32,
    pub sending_snap_count: u32,
    pub receiving_snap_count: u32,
    pub applying_snap_count: u32,
    /// Unix timestamp (seconds) when the store process started.
    pub start_time: u32,
    pub is_busy: bool,
}

/// Persisted store record: metadata plus the latest heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreRecord {
    pub store: Store,
    pub stats: Option<StoreStats>,
    /// Unix timestamp (seconds) of the last heartbeat, 0 if none yet.
    pub last_heartbeat: u64,
}

// ── Region ─────────────────────────────────────────────────────────

/// One replica of a region, hosted on a store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
}

/// Version pair bumped on membership change (`conf_ver`) and on
/// split/merge (`version`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// A contiguous `[start_key, end_key)` key range. An empty `end_key`
/// means the range is unbounded on the right.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

impl Region {
    /// Whether `key` falls inside this region's range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }
}

/// A peer reported as unreachable by the region leader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PeerStats {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// A reporting node's view of one region at a point in time.
///
/// Built fresh from each region heartbeat; the persisted form is the
/// latest view received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegionInfo {
    pub region: Region,
    pub leader: Option<Peer>,
    pub down_peers: Vec<PeerStats>,
    pub pending_peers: Vec<Peer>,
    pub written_bytes: u64,
}

impl RegionInfo {
    pub fn new(region: Region, leader: Option<Peer>) -> Self {
        Self {
            region,
            leader,
            ..Default::default()
        }
    }

    pub fn id(&self) -> RegionId {
        self.region.id
    }

    /// Store hosting the leader replica, if a leader is known.
    pub fn leader_store_id(&self) -> Option<StoreId> {
        self.leader.map(|p| p.store_id)
    }
}

// ── Cluster ────────────────────────────────────────────────────────

/// Cluster-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub cluster_id: u64,
    /// Target replica count per region.
    pub max_peer_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            max_peer_count: 3,
        }
    }
}

/// Marker written once when the cluster is bootstrapped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapRecord {
    pub store_id: StoreId,
    pub region_id: RegionId,
    /// Unix timestamp (seconds) of the bootstrap.
    pub bootstrapped_at: u64,
}
