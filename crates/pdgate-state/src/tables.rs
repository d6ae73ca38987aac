//! redb table definitions for the cluster-state store.
//!
//! Stores and regions use their `u64` id as key; values are JSON-serialized
//! domain types.

use redb::TableDefinition;

/// Store records keyed by store id.
pub const STORES: TableDefinition<u64, &[u8]> = TableDefinition::new("stores");

/// Region records keyed by region id.
pub const REGIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("regions");

/// Singleton records keyed by name (see the `META_*` keys).
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const META_CLUSTER_ID: &str = "cluster_id";
pub const META_BOOTSTRAP: &str = "bootstrap";
pub const META_CONFIG: &str = "config";
pub const META_ALLOC_ID: &str = "alloc_id";
pub const META_TSO: &str = "tso";
