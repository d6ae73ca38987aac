//! pdgate-state — durable cluster state for the pdgate control plane.
//!
//! Backed by [redb](https://docs.rs/redb), persists the topology the
//! gateway serves: stores, regions, the cluster config, the bootstrap
//! marker and the allocator high-water marks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Stores and regions are keyed by their numeric id; singleton records
//! (config, bootstrap marker, allocator bounds) live in a `meta` table
//! keyed by name.
//!
//! The `ClusterStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::ClusterStore;
pub use types::*;
