//! Store lifecycle gate.
//!
//! Tombstoned stores are decommissioned for good: store heartbeats and
//! metadata writes against them short-circuit with `STORE_TOMBSTONE`.

use pdgate_state::StoreId;

use crate::cluster::ClusterState;
use crate::error::{GatewayError, GatewayResult};

/// Reject writes against a tombstoned store.
///
/// An unknown store passes (it may be registering for the first time), and
/// so does a failed lookup: the write itself will surface any real
/// cluster-state failure. Read-only.
pub fn check_store(cluster: &dyn ClusterState, store_id: StoreId) -> GatewayResult<()> {
    match cluster.get_store(store_id) {
        Ok(Some(store)) if store.is_tombstone() => Err(GatewayError::StoreTombstone { store_id }),
        _ => Ok(()),
    }
}
