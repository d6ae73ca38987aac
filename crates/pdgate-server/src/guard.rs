//! Cluster identity guard.
//!
//! Runs before any state access: only the elected leader may answer, and
//! only for requests addressed to this cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::proto;

/// Leadership view shared with the election component.
///
/// The election side calls [`Leadership::set_leader`]; the gateway only
/// reads. Member id 0 means "no leader known".
#[derive(Debug, Clone)]
pub struct Leadership {
    member_id: u64,
    leader: Arc<AtomicU64>,
}

impl Leadership {
    /// Create a leadership view for the local member, with no leader yet.
    pub fn new(member_id: u64) -> Self {
        Self {
            member_id,
            leader: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record the currently elected leader.
    pub fn set_leader(&self, leader_id: u64) {
        self.leader.store(leader_id, Ordering::Release);
    }

    /// Forget the current leader (e.g. on lease loss).
    pub fn clear(&self) {
        self.leader.store(0, Ordering::Release);
    }

    pub fn leader_id(&self) -> Option<u64> {
        match self.leader.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn member_id(&self) -> u64 {
        self.member_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.member_id)
    }
}

/// Validates leadership and cluster identity of inbound requests.
#[derive(Debug, Clone)]
pub struct ClusterGuard {
    cluster_id: u64,
    leadership: Leadership,
}

impl ClusterGuard {
    pub fn new(cluster_id: u64, leadership: Leadership) -> Self {
        Self {
            cluster_id,
            leadership,
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// Check that this server leads and that the request targets our
    /// cluster. A missing header counts as cluster id 0.
    pub fn validate(&self, header: Option<&proto::RequestHeader>) -> GatewayResult<()> {
        if !self.leadership.is_leader() {
            debug!(leader = ?self.leadership.leader_id(), "rejecting request: not leader");
            return Err(GatewayError::NotLeader);
        }
        let got = header.map(|h| h.cluster_id).unwrap_or(0);
        if got != self.cluster_id {
            debug!(expected = self.cluster_id, got, "rejecting request: cluster id mismatch");
            return Err(GatewayError::ClusterMismatch {
                expected: self.cluster_id,
                got,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cluster_id: u64) -> proto::RequestHeader {
        proto::RequestHeader { cluster_id }
    }

    fn leading_guard(cluster_id: u64) -> ClusterGuard {
        let leadership = Leadership::new(1);
        leadership.set_leader(1);
        ClusterGuard::new(cluster_id, leadership)
    }

    #[test]
    fn leader_with_matching_id_passes() {
        let guard = leading_guard(100);
        assert!(guard.validate(Some(&header(100))).is_ok());
    }

    #[test]
    fn follower_is_rejected() {
        let leadership = Leadership::new(1);
        leadership.set_leader(2);
        let guard = ClusterGuard::new(100, leadership);
        assert!(matches!(
            guard.validate(Some(&header(100))),
            Err(GatewayError::NotLeader)
        ));
    }

    #[test]
    fn no_leader_is_rejected() {
        let guard = ClusterGuard::new(100, Leadership::new(1));
        assert!(matches!(
            guard.validate(Some(&header(100))),
            Err(GatewayError::NotLeader)
        ));
    }

    #[test]
    fn mismatch_reports_both_ids() {
        let guard = leading_guard(100);
        match guard.validate(Some(&header(7))) {
            Err(GatewayError::ClusterMismatch { expected, got }) => {
                assert_eq!(expected, 100);
                assert_eq!(got, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_header_is_a_mismatch() {
        let guard = leading_guard(100);
        assert!(matches!(
            guard.validate(None),
            Err(GatewayError::ClusterMismatch { got: 0, .. })
        ));
    }

    #[test]
    fn leadership_change_is_observed_by_clones() {
        let leadership = Leadership::new(1);
        let guard = ClusterGuard::new(5, leadership.clone());
        assert!(guard.validate(Some(&header(5))).is_err());

        leadership.set_leader(1);
        assert!(guard.validate(Some(&header(5))).is_ok());

        leadership.clear();
        assert!(guard.validate(Some(&header(5))).is_err());
    }
}
