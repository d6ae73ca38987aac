//! Gateway configuration.

use serde::{Deserialize, Serialize};

use crate::proto;

/// Configuration for one gateway member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Cluster identity. `None` means "load the persisted id or generate one".
    pub cluster_id: Option<u64>,
    /// This member's name.
    pub name: String,
    /// This member's id; compared against the elected leader id.
    pub member_id: u64,
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
    /// The other members of the replicated set.
    pub peers: Vec<MemberConfig>,
    pub heartbeat: HeartbeatConfig,
    /// Ids reserved per allocator persistence round.
    pub alloc_step: u64,
    /// How far ahead (ms) the timestamp oracle persists its bound.
    pub tso_save_interval_ms: u64,
    /// Replica count written into the cluster config at bootstrap.
    pub max_peer_count: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cluster_id: None,
            name: "pd".to_string(),
            member_id: 1,
            client_urls: vec!["http://127.0.0.1:2379".to_string()],
            peer_urls: vec!["http://127.0.0.1:2380".to_string()],
            peers: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
            alloc_step: 1000,
            tso_save_interval_ms: 3000,
            max_peer_count: 3,
        }
    }
}

impl ServerConfig {
    /// All members of the replicated set, this one first.
    pub fn members(&self) -> Vec<proto::Member> {
        let local = MemberConfig {
            name: self.name.clone(),
            member_id: self.member_id,
            peer_urls: self.peer_urls.clone(),
            client_urls: self.client_urls.clone(),
        };
        std::iter::once(&local)
            .chain(self.peers.iter())
            .map(MemberConfig::to_proto)
            .collect()
    }
}

/// A remote member of the replicated set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    pub name: String,
    pub member_id: u64,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

impl MemberConfig {
    pub fn to_proto(&self) -> proto::Member {
        proto::Member {
            name: self.name.clone(),
            member_id: self.member_id,
            peer_urls: self.peer_urls.clone(),
            client_urls: self.client_urls.clone(),
        }
    }
}

/// Region heartbeat reply discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// Replies are pushed only when the scheduler issues an instruction.
    #[default]
    Stream,
    /// Legacy: every accepted heartbeat gets exactly one reply, an empty
    /// header-only one when the scheduler has nothing to say.
    Unary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub mode: HeartbeatMode,
    /// Instructions queued per subscription. Once full, instructions
    /// published from other streams are dropped for that subscriber.
    pub subscription_buffer: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            mode: HeartbeatMode::Stream,
            subscription_buffer: 64,
        }
    }
}
