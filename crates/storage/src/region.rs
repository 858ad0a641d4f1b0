//! Region (partition) descriptors.

use dtx_common::{Location, PartitionId, TableId};
use serde::{Deserialize, Serialize};

/// Membership/ownership generation of a region.
///
/// `conf_ver` moves on replica membership changes, `version` on split/merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True when `self` is at least as new as `other` on both axes.
    pub fn covers(&self, other: &RegionEpoch) -> bool {
        self.conf_ver >= other.conf_ver && self.version >= other.version
    }
}

/// Key-range ownership record of one region.
///
/// Keys are raw store keys; an empty `end_key` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub id: PartitionId,
    pub table: TableId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub leader: Location,
    pub peers: Vec<Location>,
    pub epoch: RegionEpoch,
}

impl RegionDescriptor {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Routing header for requests addressed to this region under the caller's view.
    pub fn context(&self) -> RegionContext {
        RegionContext {
            region_id: self.id,
            leader: self.leader.clone(),
            epoch: self.epoch,
        }
    }

    /// Clamps `[start, end)` to this region's key range.
    pub fn clamp(&self, range: &KeyRange) -> Option<KeyRange> {
        let start = if range.start.as_slice() > self.start_key.as_slice() {
            range.start.clone()
        } else {
            self.start_key.clone()
        };
        let end = match (range.end.is_empty(), self.end_key.is_empty()) {
            (true, _) => self.end_key.clone(),
            (false, true) => range.end.clone(),
            (false, false) => range.end.clone().min(self.end_key.clone()),
        };
        if !end.is_empty() && start >= end {
            return None;
        }
        Some(KeyRange { start, end })
    }
}

/// Request header naming the region, leader and epoch a caller believes current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionContext {
    pub region_id: PartitionId,
    pub leader: Location,
    pub epoch: RegionEpoch,
}

/// Half-open raw key range; empty `end` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{Location, PartitionId, TableId};

    use super::{KeyRange, RegionDescriptor, RegionEpoch};

    fn region(start: &[u8], end: &[u8]) -> RegionDescriptor {
        RegionDescriptor {
            id: PartitionId(1),
            table: TableId(1),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            leader: Location::new("n1", 1),
            peers: vec![Location::new("n1", 1)],
            epoch: RegionEpoch::new(1, 1),
        }
    }

    #[test]
    fn contains_respects_unbounded_end() {
        let r = region(b"b", b"");
        assert!(!r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(r.contains(b"zzz"));
    }

    #[test]
    fn clamp_intersects_ranges() {
        let r = region(b"b", b"m");
        assert_eq!(
            r.clamp(&KeyRange::new(b"a".to_vec(), b"c".to_vec())),
            Some(KeyRange::new(b"b".to_vec(), b"c".to_vec()))
        );
        assert_eq!(
            r.clamp(&KeyRange::default()),
            Some(KeyRange::new(b"b".to_vec(), b"m".to_vec()))
        );
        assert_eq!(r.clamp(&KeyRange::new(b"x".to_vec(), Vec::new())), None);
    }

    #[test]
    fn epoch_cover_is_componentwise() {
        assert!(RegionEpoch::new(2, 3).covers(&RegionEpoch::new(2, 1)));
        assert!(!RegionEpoch::new(2, 3).covers(&RegionEpoch::new(3, 1)));
    }
}
