//! In-memory region stores used by the embedded engine and by tests.
//!
//! Each [`MemoryStore`] plays one raft region: it owns the authoritative descriptor, keeps a
//! small MVCC history per key plus pre-write locks, and rejects requests whose routing
//! header is stale with the same codes a replicated store would return.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use dtx_common::{DtxError, Location, PartitionId, Result, StoreErrorCode, TableId};
use tracing::debug;

use crate::region::{KeyRange, RegionContext, RegionDescriptor};
use crate::route::RouteSource;
use crate::store::{
    CommitRequest, KeyValue, Mutation, PrewriteRequest, RollbackRequest, StoreInstance,
    StoreService,
};

#[derive(Debug, Clone)]
struct Version {
    start_ts: u64,
    commit_ts: u64,
    /// `None` is a delete tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Lock {
    start_ts: u64,
    mutation: Mutation,
}

#[derive(Debug)]
struct MemoryState {
    region: RegionDescriptor,
    leader_available: bool,
    versions: BTreeMap<Vec<u8>, Vec<Version>>,
    locks: BTreeMap<Vec<u8>, Lock>,
    injected: VecDeque<StoreErrorCode>,
}

impl MemoryState {
    fn check(&mut self, ctx: &RegionContext, keys: &[&[u8]]) -> Result<()> {
        if let Some(code) = self.injected.pop_front() {
            return Err(DtxError::store(code, "injected failure"));
        }
        let region = &self.region;
        if ctx.region_id != region.id {
            return Err(DtxError::store(
                StoreErrorCode::NoRegionFound,
                format!("store {} does not host {}", region.id, ctx.region_id),
            ));
        }
        if !self.leader_available {
            return Err(DtxError::store(
                StoreErrorCode::LeaderNotAvailable,
                format!("region {} has no leader", region.id),
            ));
        }
        if ctx.leader != region.leader {
            return Err(DtxError::store(
                StoreErrorCode::NotLeader,
                format!("{} is not leader of {}, try {}", ctx.leader, region.id, region.leader),
            ));
        }
        let conf_changed = ctx.epoch.conf_ver != region.epoch.conf_ver;
        let version_changed = ctx.epoch.version != region.epoch.version;
        let epoch_code = match (conf_changed, version_changed) {
            (true, true) => Some(StoreErrorCode::InvalidRegionEpoch),
            (true, false) => Some(StoreErrorCode::InvalidRegionMembership),
            (false, true) => Some(StoreErrorCode::InvalidRegionVersion),
            (false, false) => None,
        };
        if let Some(code) = epoch_code {
            return Err(DtxError::store(
                code,
                format!(
                    "region {} epoch is {:?}, request carried {:?}",
                    region.id, region.epoch, ctx.epoch
                ),
            ));
        }
        if let Some(key) = keys.iter().find(|k| !region.contains(k)) {
            return Err(DtxError::store(
                StoreErrorCode::KeyOutOfRange,
                format!("key {key:?} is outside region {}", region.id),
            ));
        }
        Ok(())
    }

    fn latest(&self, key: &[u8]) -> Option<&Version> {
        self.versions.get(key).and_then(|v| v.last())
    }
}

/// One in-memory region replica group.
#[derive(Debug)]
pub struct MemoryStore {
    id: PartitionId,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(region: RegionDescriptor) -> Self {
        Self {
            id: region.id,
            state: Mutex::new(MemoryState {
                region,
                leader_available: true,
                versions: BTreeMap::new(),
                locks: BTreeMap::new(),
                injected: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            DtxError::store(
                StoreErrorCode::StorageError,
                format!("store {} state lock poisoned", self.id),
            )
        })
    }

    /// Authoritative descriptor.
    pub fn region(&self) -> Result<RegionDescriptor> {
        Ok(self.lock()?.region.clone())
    }

    /// Queues `code` to be returned by the next request, before any routing check.
    pub fn fail_next(&self, code: StoreErrorCode) -> Result<()> {
        self.lock()?.injected.push_back(code);
        Ok(())
    }

    /// Moves leadership to `leader` (added to peers if new).
    pub fn transfer_leader(&self, leader: Location) -> Result<()> {
        let mut st = self.lock()?;
        if !st.region.peers.contains(&leader) {
            st.region.peers.push(leader.clone());
            st.region.epoch.conf_ver += 1;
        }
        st.region.leader = leader;
        Ok(())
    }

    pub fn set_leader_available(&self, available: bool) -> Result<()> {
        self.lock()?.leader_available = available;
        Ok(())
    }

    /// Simulates a membership change.
    pub fn bump_conf_ver(&self) -> Result<()> {
        self.lock()?.region.epoch.conf_ver += 1;
        Ok(())
    }

    /// Latest committed value of `key`, bypassing routing checks.
    pub fn committed_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.latest(key).and_then(|v| v.value.clone()))
    }

    pub fn lock_count(&self) -> Result<usize> {
        Ok(self.lock()?.locks.len())
    }

    /// Splits off `[at, end)` into a new region `new_id`, bumping both versions.
    fn split(&self, at: &[u8], new_id: PartitionId) -> Result<MemoryStore> {
        let mut st = self.lock()?;
        if !st.region.contains(at) || at == st.region.start_key.as_slice() {
            return Err(DtxError::Planning(format!(
                "split key {at:?} is not strictly inside region {}",
                st.region.id
            )));
        }
        let mut right_region = st.region.clone();
        right_region.id = new_id;
        right_region.start_key = at.to_vec();
        right_region.epoch.version += 1;
        st.region.end_key = at.to_vec();
        st.region.epoch.version += 1;

        let right_versions = st.versions.split_off(at);
        let right_locks = st.locks.split_off(at);
        let right = MemoryStore::new(right_region);
        {
            let mut rs = right.lock()?;
            rs.versions = right_versions;
            rs.locks = right_locks;
        }
        Ok(right)
    }
}

impl StoreInstance for MemoryStore {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn get(&self, ctx: &RegionContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut st = self.lock()?;
        st.check(ctx, &[key])?;
        Ok(st.latest(key).and_then(|v| v.value.clone()))
    }

    fn scan(&self, ctx: &RegionContext, range: &KeyRange, limit: usize) -> Result<Vec<KeyValue>> {
        let mut st = self.lock()?;
        st.check(ctx, &[])?;
        let Some(bounded) = st.region.clamp(range) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (key, versions) in st.versions.range(bounded.start.clone()..) {
            if !bounded.end.is_empty() && key.as_slice() >= bounded.end.as_slice() {
                break;
            }
            if out.len() >= limit {
                break;
            }
            if let Some(value) = versions.last().and_then(|v| v.value.clone()) {
                out.push(KeyValue {
                    key: key.clone(),
                    value,
                });
            }
        }
        Ok(out)
    }

    fn put(&self, ctx: &RegionContext, pairs: Vec<KeyValue>) -> Result<()> {
        let mut st = self.lock()?;
        let keys = pairs.iter().map(|kv| kv.key.as_slice()).collect::<Vec<_>>();
        st.check(ctx, &keys)?;
        // Raw writes replace the key's history.
        for kv in pairs {
            st.versions.insert(
                kv.key,
                vec![Version {
                    start_ts: 0,
                    commit_ts: 0,
                    value: Some(kv.value),
                }],
            );
        }
        Ok(())
    }

    fn prewrite(&self, ctx: &RegionContext, req: &PrewriteRequest) -> Result<()> {
        let mut st = self.lock()?;
        let keys = req
            .mutations
            .iter()
            .map(|m| m.key.as_slice())
            .collect::<Vec<_>>();
        st.check(ctx, &keys)?;
        for m in &req.mutations {
            if let Some(lock) = st.locks.get(&m.key) {
                if lock.start_ts != req.start_ts {
                    return Err(DtxError::store(
                        StoreErrorCode::WriteConflict,
                        format!("key {:?} is locked by start_ts {}", m.key, lock.start_ts),
                    ));
                }
            }
            if let Some(latest) = st.latest(&m.key) {
                if latest.commit_ts > req.start_ts {
                    return Err(DtxError::store(
                        StoreErrorCode::WriteConflict,
                        format!(
                            "key {:?} committed at {} after start_ts {}",
                            m.key, latest.commit_ts, req.start_ts
                        ),
                    ));
                }
            }
        }
        for m in &req.mutations {
            st.locks.insert(
                m.key.clone(),
                Lock {
                    start_ts: req.start_ts,
                    mutation: m.clone(),
                },
            );
        }
        debug!(
            partition_id = %self.id,
            start_ts = req.start_ts,
            keys = req.mutations.len(),
            operator = "MemoryStorePrewrite",
            "keys locked"
        );
        Ok(())
    }

    fn commit(&self, ctx: &RegionContext, req: &CommitRequest) -> Result<()> {
        let mut st = self.lock()?;
        let keys = req.keys.iter().map(|k| k.as_slice()).collect::<Vec<_>>();
        st.check(ctx, &keys)?;
        for key in &req.keys {
            let locked = st
                .locks
                .get(key)
                .is_some_and(|l| l.start_ts == req.start_ts);
            let already_committed = st
                .versions
                .get(key)
                .is_some_and(|vs| vs.iter().any(|v| v.start_ts == req.start_ts));
            if !locked && !already_committed {
                return Err(DtxError::store(
                    StoreErrorCode::TxnLockNotFound,
                    format!("no lock for key {key:?} at start_ts {}", req.start_ts),
                ));
            }
        }
        for key in &req.keys {
            let Some(lock) = st.locks.remove(key) else {
                continue;
            };
            if lock.start_ts != req.start_ts {
                st.locks.insert(key.clone(), lock);
                continue;
            }
            st.versions.entry(key.clone()).or_default().push(Version {
                start_ts: lock.start_ts,
                commit_ts: req.commit_ts,
                value: lock.mutation.value,
            });
        }
        Ok(())
    }

    fn rollback(&self, ctx: &RegionContext, req: &RollbackRequest) -> Result<()> {
        let mut st = self.lock()?;
        let keys = req.keys.iter().map(|k| k.as_slice()).collect::<Vec<_>>();
        st.check(ctx, &keys)?;
        for key in &req.keys {
            if st
                .locks
                .get(key)
                .is_some_and(|l| l.start_ts == req.start_ts)
            {
                st.locks.remove(key);
            }
            if let Some(versions) = st.versions.get_mut(key) {
                versions.retain(|v| v.start_ts != req.start_ts);
                if versions.is_empty() {
                    st.versions.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// Node-local store service over in-memory regions; also answers as the route source.
#[derive(Debug, Default)]
pub struct MemoryStoreService {
    stores: RwLock<HashMap<PartitionId, Arc<MemoryStore>>>,
}

impl MemoryStoreService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&self, region: RegionDescriptor) -> Result<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new(region));
        self.stores
            .write()
            .map_err(|_| poisoned())?
            .insert(store.id, Arc::clone(&store));
        Ok(store)
    }

    pub fn store(&self, id: PartitionId) -> Option<Arc<MemoryStore>> {
        self.stores.read().ok()?.get(&id).cloned()
    }

    /// Splits region `id` at `at`; the right half becomes `new_id`.
    pub fn split_region(&self, id: PartitionId, at: &[u8], new_id: PartitionId) -> Result<()> {
        let left = self.store(id).ok_or_else(|| {
            DtxError::store(StoreErrorCode::NoRegionFound, format!("no store for {id}"))
        })?;
        let right = left.split(at, new_id)?;
        self.stores
            .write()
            .map_err(|_| poisoned())?
            .insert(new_id, Arc::new(right));
        Ok(())
    }

    pub fn regions(&self) -> Result<Vec<RegionDescriptor>> {
        let stores = self
            .stores
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect::<Vec<_>>();
        stores.iter().map(|s| s.region()).collect()
    }
}

fn poisoned() -> DtxError {
    DtxError::store(StoreErrorCode::StorageError, "store registry lock poisoned")
}

impl StoreService for MemoryStoreService {
    fn get_instance(&self, id: PartitionId) -> Option<Arc<dyn StoreInstance>> {
        self.store(id).map(|s| s as Arc<dyn StoreInstance>)
    }

    fn delete_instance(&self, id: PartitionId) {
        if let Ok(mut stores) = self.stores.write() {
            stores.remove(&id);
        }
    }
}

impl RouteSource for MemoryStoreService {
    fn fetch_region(&self, id: PartitionId) -> Result<RegionDescriptor> {
        self.store(id)
            .ok_or_else(|| {
                DtxError::store(StoreErrorCode::NoRegionFound, format!("unknown region {id}"))
            })?
            .region()
    }

    fn fetch_leader(&self, id: PartitionId) -> Result<Location> {
        Ok(self.fetch_region(id)?.leader)
    }

    fn fetch_table_regions(&self, table: TableId) -> Result<Vec<RegionDescriptor>> {
        let mut regions = self
            .regions()?
            .into_iter()
            .filter(|r| r.table == table)
            .collect::<Vec<_>>();
        regions.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        Ok(regions)
    }
}
