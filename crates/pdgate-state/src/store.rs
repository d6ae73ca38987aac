//! ClusterStore — redb-backed persistence for cluster topology.
//!
//! Provides typed CRUD operations over stores, regions and the singleton
//! cluster records. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type IdTable = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe cluster-state store backed by redb.
#[derive(Clone)]
pub struct ClusterStore {
    db: Arc<Database>,
}

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory cluster store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(STORES).map_err(map_err!(Table))?;
        txn.open_table(REGIONS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_by_id<T: DeserializeOwned>(&self, def: IdTable, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_all<T: DeserializeOwned>(&self, def: IdTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Stores ─────────────────────────────────────────────────────

    /// Insert or update a store record.
    pub fn put_store(&self, record: &StoreRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STORES).map_err(map_err!(Table))?;
            table
                .insert(record.store.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(store_id = record.store.id, "store record stored");
        Ok(())
    }

    /// Get a store record by id.
    pub fn get_store(&self, store_id: StoreId) -> StateResult<Option<StoreRecord>> {
        self.get_by_id(STORES, store_id)
    }

    /// List all store records.
    pub fn list_stores(&self) -> StateResult<Vec<StoreRecord>> {
        self.list_all(STORES)
    }

    // ── Regions ────────────────────────────────────────────────────

    /// Insert or update a single region.
    pub fn put_region(&self, region: &RegionInfo) -> StateResult<()> {
        self.put_regions(std::slice::from_ref(region))
    }

    /// Insert or update several regions in one transaction.
    pub fn put_regions(&self, regions: &[RegionInfo]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            for region in regions {
                let value = serde_json::to_vec(region).map_err(map_err!(Serialize))?;
                table
                    .insert(region.id(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = regions.len(), "regions stored");
        Ok(())
    }

    /// Get a region by id.
    pub fn get_region(&self, region_id: RegionId) -> StateResult<Option<RegionInfo>> {
        self.get_by_id(REGIONS, region_id)
    }

    /// Find the region whose key range contains `key`.
    pub fn get_region_by_key(&self, key: &[u8]) -> StateResult<Option<RegionInfo>> {
        let regions: Vec<RegionInfo> = self.list_all(REGIONS)?;
        Ok(regions.into_iter().find(|r| r.region.contains(key)))
    }

    /// List all regions.
    pub fn list_regions(&self) -> StateResult<Vec<RegionInfo>> {
        self.list_all(REGIONS)
    }

    // ── Cluster ────────────────────────────────────────────────────

    /// Get the cluster config, if one has been written.
    pub fn get_config(&self) -> StateResult<Option<ClusterConfig>> {
        self.get_meta(META_CONFIG)
    }

    /// Replace the cluster config.
    pub fn put_config(&self, config: &ClusterConfig) -> StateResult<()> {
        self.put_meta(META_CONFIG, config)
    }

    /// Get the persisted cluster id.
    pub fn get_cluster_id(&self) -> StateResult<Option<u64>> {
        self.get_meta(META_CLUSTER_ID)
    }

    pub fn put_cluster_id(&self, cluster_id: u64) -> StateResult<()> {
        self.put_meta(META_CLUSTER_ID, &cluster_id)
    }

    pub fn bootstrap_record(&self) -> StateResult<Option<BootstrapRecord>> {
        self.get_meta(META_BOOTSTRAP)
    }

    pub fn is_bootstrapped(&self) -> StateResult<bool> {
        Ok(self.bootstrap_record()?.is_some())
    }

    /// Write the first store, first region, config and bootstrap marker in
    /// a single transaction.
    ///
    /// Fails with [`StateError::AlreadyBootstrapped`] if the marker exists;
    /// nothing is written in that case.
    pub fn bootstrap(
        &self,
        store: &StoreRecord,
        region: &RegionInfo,
        config: &ClusterConfig,
        marker: &BootstrapRecord,
    ) -> StateResult<()> {
        let store_value = serde_json::to_vec(store).map_err(map_err!(Serialize))?;
        let region_value = serde_json::to_vec(region).map_err(map_err!(Serialize))?;
        let config_value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let marker_value = serde_json::to_vec(marker).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            if meta.get(META_BOOTSTRAP).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyBootstrapped);
            }
            meta.insert(META_CONFIG, config_value.as_slice())
                .map_err(map_err!(Write))?;
            meta.insert(META_BOOTSTRAP, marker_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut stores = txn.open_table(STORES).map_err(map_err!(Table))?;
            stores
                .insert(store.store.id, store_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut regions = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            regions
                .insert(region.id(), region_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            store_id = store.store.id,
            region_id = region.id(),
            "bootstrap records stored"
        );
        Ok(())
    }

    // ── Allocator bounds ───────────────────────────────────────────

    /// Highest id the id allocator may have handed out.
    pub fn get_alloc_bound(&self) -> StateResult<u64> {
        Ok(self.get_meta(META_ALLOC_ID)?.unwrap_or(0))
    }

    pub fn put_alloc_bound(&self, bound: u64) -> StateResult<()> {
        self.put_meta(META_ALLOC_ID, &bound)
    }

    /// Physical time (ms) the timestamp oracle has reserved up to.
    pub fn get_tso_bound(&self) -> StateResult<u64> {
        Ok(self.get_meta(META_TSO)?.unwrap_or(0))
    }

    pub fn put_tso_bound(&self, physical_ms: u64) -> StateResult<()> {
        self.put_meta(META_TSO, &physical_ms)
    }
}
