//! Type conversions between wire messages and state store types.
//!
//! Bridges `proto::{Store, Region, Peer, ...}` to the
//! `pdgate_state` domain types the cluster-state collaborator works on.

use pdgate_state as state;

use crate::proto;

pub fn peer_from_proto(peer: &proto::Peer) -> state::Peer {
    state::Peer {
        id: peer.id,
        store_id: peer.store_id,
    }
}

pub fn peer_to_proto(peer: &state::Peer) -> proto::Peer {
    proto::Peer {
        id: peer.id,
        store_id: peer.store_id,
    }
}

pub fn region_from_proto(region: &proto::Region) -> state::Region {
    let (conf_ver, version) = region
        .region_epoch
        .as_ref()
        .map_or((0, 0), |e| (e.conf_ver, e.version));
    state::Region {
        id: region.id,
        start_key: region.start_key.clone(),
        end_key: region.end_key.clone(),
        epoch: state::RegionEpoch { conf_ver, version },
        peers: region.peers.iter().map(peer_from_proto).collect(),
    }
}

pub fn region_to_proto(region: &state::Region) -> proto::Region {
    proto::Region {
        id: region.id,
        start_key: region.start_key.clone(),
        end_key: region.end_key.clone(),
        region_epoch: Some(epoch_to_proto(&region.epoch)),
        peers: region.peers.iter().map(peer_to_proto).collect(),
    }
}

pub fn epoch_to_proto(epoch: &state::RegionEpoch) -> proto::RegionEpoch {
    proto::RegionEpoch {
        conf_ver: epoch.conf_ver,
        version: epoch.version,
    }
}

pub fn store_from_proto(store: &proto::Store) -> state::Store {
    let state = match store.state() {
        proto::StoreState::Up => state::StoreState::Up,
        proto::StoreState::Offline => state::StoreState::Offline,
        proto::StoreState::Tombstone => state::StoreState::Tombstone,
    };
    state::Store {
        id: store.id,
        address: store.address.clone(),
        state,
        labels: store
            .labels
            .iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect(),
    }
}

pub fn store_to_proto(store: &state::Store) -> proto::Store {
    let state = match store.state {
        state::StoreState::Up => proto::StoreState::Up,
        state::StoreState::Offline => proto::StoreState::Offline,
        state::StoreState::Tombstone => proto::StoreState::Tombstone,
    };
    let mut labels: Vec<proto::StoreLabel> = store
        .labels
        .iter()
        .map(|(key, value)| proto::StoreLabel {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    labels.sort_by(|a, b| a.key.cmp(&b.key));
    proto::Store {
        id: store.id,
        address: store.address.clone(),
        state: state as i32,
        labels,
    }
}

pub fn stats_from_proto(stats: &proto::StoreStats) -> state::StoreStats {
    state::StoreStats {
        store_id: stats.store_id,
        capacity: stats.capacity,
        available: stats.available,
        region_count: stats.region_count,
        sending_snap_count: stats.sending_snap_count,
        receiving_snap_count: stats.receiving_snap_count,
        applying_snap_count: stats.applying_snap_count,
        start_time: stats.start_time,
        is_busy: stats.is_busy,
    }
}

pub fn config_from_proto(cluster: &proto::Cluster) -> state::ClusterConfig {
    state::ClusterConfig {
        cluster_id: cluster.id,
        max_peer_count: cluster.max_peer_count,
    }
}

pub fn config_to_proto(config: &state::ClusterConfig) -> proto::Cluster {
    proto::Cluster {
        id: config.cluster_id,
        max_peer_count: config.max_peer_count,
    }
}

/// Build the region view carried by one heartbeat.
pub fn region_info_from_heartbeat(req: &proto::RegionHeartbeatRequest) -> state::RegionInfo {
    let region = req
        .region
        .as_ref()
        .map(region_from_proto)
        .unwrap_or_default();
    state::RegionInfo {
        region,
        leader: req.leader.as_ref().map(peer_from_proto),
        down_peers: req
            .down_peers
            .iter()
            .map(|s| state::PeerStats {
                peer: s.peer.as_ref().map(peer_from_proto).unwrap_or_default(),
                down_seconds: s.down_seconds,
            })
            .collect(),
        pending_peers: req.pending_peers.iter().map(peer_from_proto).collect(),
        written_bytes: req.bytes_written,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_without_region_yields_zero_id() {
        let req = proto::RegionHeartbeatRequest::default();
        let info = region_info_from_heartbeat(&req);
        assert_eq!(info.id(), 0);
        assert!(info.leader.is_none());
    }

    #[test]
    fn heartbeat_carries_peer_status() {
        let leader = proto::Peer { id: 11, store_id: 1 };
        let follower = proto::Peer { id: 12, store_id: 2 };
        let req = proto::RegionHeartbeatRequest {
            region: Some(proto::Region {
                id: 7,
                peers: vec![leader.clone(), follower.clone()],
                ..Default::default()
            }),
            leader: Some(leader),
            down_peers: vec![proto::PeerStats {
                peer: Some(follower.clone()),
                down_seconds: 30,
            }],
            pending_peers: vec![follower],
            bytes_written: 4096,
            ..Default::default()
        };

        let info = region_info_from_heartbeat(&req);
        assert_eq!(info.id(), 7);
        assert_eq!(info.leader_store_id(), Some(1));
        assert_eq!(info.down_peers[0].down_seconds, 30);
        assert_eq!(info.pending_peers, vec![state::Peer { id: 12, store_id: 2 }]);
        assert_eq!(info.written_bytes, 4096);
    }

    #[test]
    fn tombstone_state_survives_conversion() {
        let store = proto::Store {
            id: 3,
            address: "10.0.0.3:20160".to_string(),
            state: proto::StoreState::Tombstone as i32,
            labels: vec![proto::StoreLabel {
                key: "zone".to_string(),
                value: "a".to_string(),
            }],
        };
        let converted = store_from_proto(&store);
        assert!(converted.is_tombstone());
        assert_eq!(converted.labels.get("zone").unwrap(), "a");
        assert_eq!(store_to_proto(&converted), store);
    }
}
