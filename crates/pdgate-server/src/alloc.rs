//! ID and timestamp allocation.
//!
//! Both allocators reserve ahead in the cluster store so values never
//! repeat across restarts: ids in `step`-sized batches, timestamps by a
//! persisted physical-time bound.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use pdgate_state::ClusterStore;

use crate::error::{GatewayError, GatewayResult};
use crate::proto;

/// Logical counter range per physical millisecond.
pub const MAX_LOGICAL: i64 = 1 << 18;

/// Hands out cluster-unique ids.
pub trait IdAllocator: Send + Sync {
    fn alloc(&self) -> GatewayResult<u64>;
}

/// Hands out strictly increasing timestamps.
pub trait TsoAllocator: Send + Sync {
    /// Reserve `count` timestamps and return the last one.
    fn alloc(&self, count: u32) -> GatewayResult<proto::Timestamp>;
}

struct IdRange {
    last: u64,
    end: u64,
}

/// Monotonic id allocator persisting a high-water mark every `step` ids.
pub struct BatchIdAllocator {
    store: ClusterStore,
    step: u64,
    range: Mutex<IdRange>,
}

impl BatchIdAllocator {
    pub fn new(store: ClusterStore, step: u64) -> GatewayResult<Self> {
        let end = store.get_alloc_bound()?;
        debug!(bound = end, step, "id allocator loaded");
        Ok(Self {
            store,
            step: step.max(1),
            range: Mutex::new(IdRange { last: end, end }),
        })
    }
}

impl IdAllocator for BatchIdAllocator {
    fn alloc(&self) -> GatewayResult<u64> {
        let mut range = self.range.lock().unwrap_or_else(PoisonError::into_inner);
        if range.last >= range.end {
            let end = range
                .end
                .checked_add(self.step)
                .ok_or_else(|| GatewayError::Alloc("id space exhausted".to_string()))?;
            self.store.put_alloc_bound(end)?;
            debug!(bound = end, "id allocator advanced");
            range.end = end;
        }
        range.last += 1;
        Ok(range.last)
    }
}

struct TsoState {
    physical: i64,
    logical: i64,
    saved_bound: i64,
}

/// Single-node timestamp oracle: physical milliseconds + logical counter.
pub struct LocalTso {
    store: ClusterStore,
    save_interval: Duration,
    state: Mutex<TsoState>,
}

impl LocalTso {
    pub fn new(store: ClusterStore, save_interval: Duration) -> GatewayResult<Self> {
        let bound = store.get_tso_bound()? as i64;
        info!(bound, "timestamp oracle loaded");
        Ok(Self {
            store,
            save_interval,
            state: Mutex::new(TsoState {
                physical: bound,
                logical: 0,
                saved_bound: bound,
            }),
        })
    }
}

impl LocalTso {
    /// Advance the oracle to `now`. A new bound goes through `persist`
    /// before any state changes, so a failed write leaves the oracle
    /// where it was.
    fn advance(
        &self,
        count: u32,
        now: i64,
        persist: impl FnOnce(i64) -> GatewayResult<()>,
    ) -> GatewayResult<proto::Timestamp> {
        let count = i64::from(count);
        if count == 0 || count >= MAX_LOGICAL {
            return Err(GatewayError::InvalidRequest(format!(
                "tso count should be in 1..{MAX_LOGICAL}, got {count}"
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut physical, mut logical) = (state.physical, state.logical);
        if now > physical {
            physical = now;
            logical = 0;
        }
        if logical + count >= MAX_LOGICAL {
            physical += 1;
            logical = 0;
        }
        logical += count;

        if physical >= state.saved_bound {
            let bound = physical + self.save_interval.as_millis() as i64;
            persist(bound)?;
            state.saved_bound = bound;
        }
        state.physical = physical;
        state.logical = logical;

        Ok(proto::Timestamp { physical, logical })
    }
}

impl TsoAllocator for LocalTso {
    fn alloc(&self, count: u32) -> GatewayResult<proto::Timestamp> {
        self.advance(count, epoch_millis(), |bound| {
            Ok(self.store.put_tso_bound(bound as u64)?)
        })
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ClusterStore {
        ClusterStore::open_in_memory().unwrap()
    }

    fn ts_key(ts: &proto::Timestamp) -> (i64, i64) {
        (ts.physical, ts.logical)
    }

    #[test]
    fn ids_are_sequential_and_unique() {
        let ids = BatchIdAllocator::new(test_store(), 10).unwrap();
        let got: Vec<u64> = (0..25).map(|_| ids.alloc().unwrap()).collect();
        assert_eq!(got, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn ids_skip_past_reserved_batch_after_restart() {
        let store = test_store();
        {
            let ids = BatchIdAllocator::new(store.clone(), 100).unwrap();
            assert_eq!(ids.alloc().unwrap(), 1);
            assert_eq!(ids.alloc().unwrap(), 2);
        }
        assert_eq!(store.get_alloc_bound().unwrap(), 100);

        let ids = BatchIdAllocator::new(store, 100).unwrap();
        assert_eq!(ids.alloc().unwrap(), 101);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let tso = LocalTso::new(test_store(), Duration::from_secs(3)).unwrap();
        let mut prev = ts_key(&tso.alloc(1).unwrap());
        for count in [1, 5, 100, 1] {
            let next = ts_key(&tso.alloc(count).unwrap());
            assert!(next > prev, "{next:?} <= {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn zero_count_is_invalid() {
        let tso = LocalTso::new(test_store(), Duration::from_secs(3)).unwrap();
        assert!(matches!(tso.alloc(0), Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn restart_never_goes_back_in_time() {
        let store = test_store();
        let first = {
            let tso = LocalTso::new(store.clone(), Duration::from_secs(60)).unwrap();
            tso.alloc(1).unwrap()
        };
        // The persisted bound is a minute ahead of anything handed out.
        let tso = LocalTso::new(store, Duration::from_secs(60)).unwrap();
        let second = tso.alloc(1).unwrap();
        assert!(second.physical > first.physical);
    }

    #[test]
    fn failed_bound_write_leaves_oracle_unchanged() {
        let store = test_store();
        let tso = LocalTso::new(store.clone(), Duration::from_secs(3)).unwrap();
        let now = epoch_millis() + 10_000;

        let err = tso
            .advance(1, now, |_| Err(GatewayError::Alloc("disk full".to_string())))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Alloc(_)));
        {
            let state = tso.state.lock().unwrap();
            assert!(state.physical < now);
            assert!(state.saved_bound < now);
        }

        let ts = tso.alloc(1).unwrap();
        assert!(ts.physical < now);
        assert!(store.get_tso_bound().unwrap() as i64 > ts.physical);
    }
}
