use dtx_common::{Location, PartitionId, Result, TableId};

use crate::region::RegionDescriptor;

/// Authoritative routing metadata (placement driver / meta service).
///
/// The directory is a cache of what this source returns; the router consults it only after
/// the classifier decided the cached entry is stale.
pub trait RouteSource: Send + Sync {
    /// Current descriptor (range, epoch, leader) of one region.
    fn fetch_region(&self, id: PartitionId) -> Result<RegionDescriptor>;

    /// Current leader of one region.
    fn fetch_leader(&self, id: PartitionId) -> Result<Location>;

    /// All regions of a table in key order.
    fn fetch_table_regions(&self, table: TableId) -> Result<Vec<RegionDescriptor>>;
}
