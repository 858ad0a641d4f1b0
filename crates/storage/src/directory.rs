//! Partition directory: table key range → region descriptors.
//!
//! Readers take an `Arc` snapshot and never observe a half-applied refresh; writers build a
//! new snapshot and swap it in under the write lock (copy-on-refresh). The directory is the
//! only place routing state is mutated after a classified routing error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use dtx_common::{DtxError, Location, PartitionId, Result, StoreErrorCode, TableId};
use tracing::debug;

use crate::region::{KeyRange, RegionDescriptor};

/// Immutable view of the directory at one point in time.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    by_id: HashMap<PartitionId, RegionDescriptor>,
    by_table: HashMap<TableId, BTreeMap<Vec<u8>, PartitionId>>,
}

impl DirectorySnapshot {
    pub fn region(&self, id: PartitionId) -> Option<&RegionDescriptor> {
        self.by_id.get(&id)
    }

    /// Region owning `key` in `table`.
    pub fn locate(&self, table: TableId, key: &[u8]) -> Option<&RegionDescriptor> {
        let ranges = self.by_table.get(&table)?;
        let (_, id) = ranges.range(..=key.to_vec()).next_back()?;
        self.by_id.get(id).filter(|r| r.contains(key))
    }

    /// Regions of `table` in key order.
    pub fn table_regions(&self, table: TableId) -> Vec<&RegionDescriptor> {
        self.by_table
            .get(&table)
            .map(|ranges| ranges.values().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Regions of `table` overlapping `range`, in key order.
    pub fn regions_in_range(&self, table: TableId, range: &KeyRange) -> Vec<&RegionDescriptor> {
        self.table_regions(table)
            .into_iter()
            .filter(|r| r.clamp(range).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, region: RegionDescriptor) {
        if let Some(old) = self.by_id.remove(&region.id) {
            if let Some(ranges) = self.by_table.get_mut(&old.table) {
                ranges.remove(&old.start_key);
            }
        }
        // A split or merge may leave an overlapping stale entry behind; drop it.
        let overlapping = self
            .by_table
            .get(&region.table)
            .map(|ranges| {
                ranges
                    .values()
                    .filter_map(|id| self.by_id.get(id))
                    .filter(|r| ranges_overlap(r, &region))
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for id in overlapping {
            if let Some(stale) = self.by_id.remove(&id) {
                if let Some(ranges) = self.by_table.get_mut(&stale.table) {
                    ranges.remove(&stale.start_key);
                }
            }
        }
        self.by_table
            .entry(region.table)
            .or_default()
            .insert(region.start_key.clone(), region.id);
        self.by_id.insert(region.id, region);
    }
}

fn ranges_overlap(a: &RegionDescriptor, b: &RegionDescriptor) -> bool {
    let a_before_b_end = b.end_key.is_empty() || a.start_key < b.end_key;
    let b_before_a_end = a.end_key.is_empty() || b.start_key < a.end_key;
    a_before_b_end && b_before_a_end
}

/// Shared, read-mostly routing table.
#[derive(Debug, Default)]
pub struct PartitionDirectory {
    current: RwLock<Arc<DirectorySnapshot>>,
}

impl PartitionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regions(regions: impl IntoIterator<Item = RegionDescriptor>) -> Self {
        let mut snapshot = DirectorySnapshot::default();
        for r in regions {
            snapshot.insert(r);
        }
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current snapshot; cheap to clone and safe to hold across a refresh.
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn region(&self, id: PartitionId) -> Result<RegionDescriptor> {
        self.snapshot().region(id).cloned().ok_or_else(|| {
            DtxError::store(
                StoreErrorCode::NoRegionFound,
                format!("partition {id} is not in the directory"),
            )
        })
    }

    pub fn locate(&self, table: TableId, key: &[u8]) -> Result<RegionDescriptor> {
        self.snapshot().locate(table, key).cloned().ok_or_else(|| {
            DtxError::store(
                StoreErrorCode::NoRegionFound,
                format!("no region of table {table} owns the key"),
            )
        })
    }

    pub fn table_regions(&self, table: TableId) -> Vec<RegionDescriptor> {
        self.snapshot()
            .table_regions(table)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Installs refreshed descriptors. Entries older than the installed ones are ignored.
    pub fn refresh(&self, regions: impl IntoIterator<Item = RegionDescriptor>) {
        self.update(|snapshot| {
            for region in regions {
                if let Some(existing) = snapshot.region(region.id) {
                    if !region.epoch.covers(&existing.epoch) {
                        debug!(
                            partition_id = %region.id,
                            operator = "DirectoryRefresh",
                            "ignoring descriptor older than the cached entry"
                        );
                        continue;
                    }
                }
                snapshot.insert(region);
            }
        });
    }

    /// Records a new leader for `id` without touching its key range or epoch.
    pub fn update_leader(&self, id: PartitionId, leader: Location) -> Result<()> {
        let mut found = false;
        self.update(|snapshot| {
            if let Some(mut region) = snapshot.region(id).cloned() {
                if !region.peers.contains(&leader) {
                    region.peers.push(leader.clone());
                }
                region.leader = leader;
                snapshot.insert(region);
                found = true;
            }
        });
        if found {
            Ok(())
        } else {
            Err(DtxError::store(
                StoreErrorCode::NoRegionFound,
                format!("partition {id} is not in the directory"),
            ))
        }
    }

    /// Forgets a region entirely (e.g. after a merge removed it).
    pub fn evict(&self, id: PartitionId) {
        self.update(|snapshot| {
            if let Some(old) = snapshot.by_id.remove(&id) {
                if let Some(ranges) = snapshot.by_table.get_mut(&old.table) {
                    ranges.remove(&old.start_key);
                }
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut DirectorySnapshot)) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = DirectorySnapshot::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{Location, PartitionId, TableId};

    use super::PartitionDirectory;
    use crate::region::{RegionDescriptor, RegionEpoch};

    fn region(id: u64, start: &[u8], end: &[u8], version: u64) -> RegionDescriptor {
        RegionDescriptor {
            id: PartitionId(id),
            table: TableId(1),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            leader: Location::new("n1", 1),
            peers: vec![Location::new("n1", 1)],
            epoch: RegionEpoch::new(1, version),
        }
    }

    #[test]
    fn locates_by_key_range() {
        let dir = PartitionDirectory::from_regions([region(1, b"", b"m", 1), region(2, b"m", b"", 1)]);
        assert_eq!(dir.locate(TableId(1), b"a").expect("a").id, PartitionId(1));
        assert_eq!(dir.locate(TableId(1), b"m").expect("m").id, PartitionId(2));
        assert!(dir.locate(TableId(2), b"a").is_err());
    }

    #[test]
    fn refresh_is_copy_on_write_for_readers() {
        let dir = PartitionDirectory::from_regions([region(1, b"", b"", 1)]);
        let before = dir.snapshot();
        dir.refresh([region(1, b"", b"m", 2), region(2, b"m", b"", 2)]);
        assert_eq!(before.len(), 1);
        assert_eq!(before.region(PartitionId(1)).expect("r1").end_key, b"".to_vec());
        let after = dir.snapshot();
        assert_eq!(after.len(), 2);
        assert_eq!(dir.locate(TableId(1), b"z").expect("z").id, PartitionId(2));
    }

    #[test]
    fn refresh_ignores_older_epochs() {
        let dir = PartitionDirectory::from_regions([region(1, b"", b"", 3)]);
        dir.refresh([region(1, b"", b"m", 2)]);
        assert_eq!(dir.region(PartitionId(1)).expect("r1").epoch.version, 3);
    }

    #[test]
    fn leader_update_keeps_range() {
        let dir = PartitionDirectory::from_regions([region(1, b"", b"", 1)]);
        dir.update_leader(PartitionId(1), Location::new("n2", 2))
            .expect("update");
        let r = dir.region(PartitionId(1)).expect("r1");
        assert_eq!(r.leader, Location::new("n2", 2));
        assert!(r.peers.contains(&Location::new("n2", 2)));
        assert!(dir.update_leader(PartitionId(9), Location::new("n2", 2)).is_err());
    }
}
