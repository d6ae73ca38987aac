//! pdgate-server — the control-plane gateway of the placement driver.
//!
//! Every storage node and client talks to this service to learn cluster
//! topology, report liveness and receive scheduling instructions.
//!
//! # Architecture
//!
//! ```text
//! Gateway (gRPC `PD` service)
//!   ├── ClusterGuard → leadership + cluster id check on every request
//!   ├── BootstrapGate → NOT_BOOTSTRAPPED / ALREADY_BOOTSTRAPPED
//!   ├── lifecycle::check_store → STORE_TOMBSTONE
//!   ├── unary ops → ClusterState / IdAllocator, wrapped by `Envelope`
//!   ├── tso::serve → stream of (timestamp, count) replies
//!   └── HeartbeatMux → per-stream receive loop + pusher task pair
//!         └── WatchRegistry → per-store operator subscriptions
//! ```
//!
//! Expected domain conditions travel in-band as `pdpb::Error` inside a
//! normal response; rejections (not leader, cluster mismatch, malformed
//! requests, internal failures) are transport-level `tonic::Status`.
//! [`GatewayError::classify`] is the single place that decides which.

pub mod alloc;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod convert;
pub mod error;
pub mod guard;
pub mod header;
pub mod heartbeat;
pub mod lifecycle;
pub mod service;
pub mod tso;
pub mod watch;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("pdpb");
}

pub use alloc::{BatchIdAllocator, IdAllocator, LocalTso, TsoAllocator};
pub use bootstrap::BootstrapGate;
pub use cluster::{ClusterState, NoopScheduler, Scheduler, StoreCluster};
pub use config::{HeartbeatConfig, HeartbeatMode, MemberConfig, ServerConfig};
pub use error::{Classified, GatewayError, GatewayResult};
pub use guard::{ClusterGuard, Leadership};
pub use heartbeat::HeartbeatMux;
pub use service::{Gateway, GatewayParts};
pub use watch::{Subscription, SubscriberKey, WatchRegistry};
