//! Region-addressed store calls with classified retry.
//!
//! The router resolves a partition to its store instance and routing header, runs the
//! caller's request, and on failure asks [`classify`] what to repair:
//! - `PeerInvalid`: re-fetch the leader and patch it into the directory
//! - `EpochInvalid`: re-fetch the table's regions and refresh the directory
//! - `Other`: return the error unchanged
//!
//! Retries are bounded by `max_routing_retries` with a linear backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dtx_common::{
    DtxError, EngineConfig, PartitionId, Result, StoreErrorCode, TableId, global_metrics,
};
use tracing::{debug, warn};

use crate::directory::PartitionDirectory;
use crate::errors::{ErrorClass, classify};
use crate::region::{KeyRange, RegionContext, RegionDescriptor};
use crate::route::RouteSource;
use crate::store::{KeyValue, Mutation, StoreInstance, StoreService};

/// Rows of one [`RegionRouter::scan_page`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub rows: Vec<KeyValue>,
    /// Start of the next page; `None` once the requested range is exhausted.
    pub resume: Option<Vec<u8>>,
}

/// Shared entry point for every remote store call made by operators and the coordinator.
#[derive(Clone)]
pub struct RegionRouter {
    directory: Arc<PartitionDirectory>,
    stores: Arc<dyn StoreService>,
    routes: Arc<dyn RouteSource>,
    max_retries: u32,
    backoff_base: Duration,
}

impl std::fmt::Debug for RegionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRouter")
            .field("regions", &self.directory.snapshot().len())
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .finish()
    }
}

impl RegionRouter {
    pub fn new(
        directory: Arc<PartitionDirectory>,
        stores: Arc<dyn StoreService>,
        routes: Arc<dyn RouteSource>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            directory,
            stores,
            routes,
            max_retries: config.max_routing_retries,
            backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
        }
    }

    pub fn directory(&self) -> &Arc<PartitionDirectory> {
        &self.directory
    }

    pub fn stores(&self) -> &Arc<dyn StoreService> {
        &self.stores
    }

    /// Store instance serving `partition` on this node; absence is a hard failure.
    pub fn instance(&self, partition: PartitionId) -> Result<Arc<dyn StoreInstance>> {
        self.stores.get_instance(partition).ok_or_else(|| {
            DtxError::Execution(format!("no store instance for partition {partition}"))
        })
    }

    /// Runs `op` against `partition`, repairing routing and retrying on stale-routing errors.
    pub fn call<T>(
        &self,
        partition: PartitionId,
        mut op: impl FnMut(&dyn StoreInstance, &RegionContext) -> Result<T>,
    ) -> Result<T> {
        self.call_resolved(
            |dir| dir.region(partition),
            |store, region| op(store, &region.context()),
        )
    }

    /// Like [`call`](Self::call), but resolves the target region with `resolve` on every
    /// attempt and hands `op` the descriptor the request is routed with.
    pub fn call_resolved<T>(
        &self,
        mut resolve: impl FnMut(&PartitionDirectory) -> Result<RegionDescriptor>,
        mut op: impl FnMut(&dyn StoreInstance, &RegionDescriptor) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let region = resolve(&self.directory)?;
            let partition = region.id;
            let instance = self.instance(partition)?;
            let err = match op(instance.as_ref(), &region) {
                Ok(v) => return Ok(v),
                Err(err) => err,
            };
            let class = classify(&err);
            if !class.is_retryable() || attempt >= self.max_retries {
                if class.is_retryable() {
                    warn!(
                        partition_id = %partition,
                        attempts = attempt + 1,
                        class = %class,
                        operator = "RegionRouter",
                        "routing retries exhausted: {err}"
                    );
                }
                return Err(err);
            }
            attempt += 1;
            debug!(
                partition_id = %partition,
                attempt,
                class = %class,
                operator = "RegionRouter",
                "retrying after stale routing: {err}"
            );
            global_metrics().inc_routing_retries(partition.0, class.as_str());
            self.repair(partition, &region, class)?;
            if !self.backoff_base.is_zero() {
                thread::sleep(self.backoff_base * attempt);
            }
        }
    }

    /// Re-resolves the region owning `key` in `table` on every attempt.
    pub fn call_key<T>(
        &self,
        table: TableId,
        key: &[u8],
        mut op: impl FnMut(&dyn StoreInstance, &RegionContext) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let result = self.call_resolved(
                |dir| dir.locate(table, key),
                |store, region| op(store, &region.context()),
            );
            match result {
                Err(err)
                    if err.store_code() == Some(StoreErrorCode::KeyOutOfRange)
                        && attempt < self.max_retries =>
                {
                    attempt += 1;
                    self.refresh_table(table)?;
                }
                other => return other,
            }
        }
    }

    /// Runs `op` once per region owning some of `mutations`, where every key belongs to the
    /// table of `partition`.
    ///
    /// Keys are grouped by the cached directory. A group rejected with `KeyOutOfRange`, which
    /// is what a split leaves behind once the epoch is repaired, is regrouped against the
    /// refreshed directory and sent again. Groups already applied are not resent.
    pub fn call_batch(
        &self,
        partition: PartitionId,
        mutations: Vec<Mutation>,
        mut op: impl FnMut(&dyn StoreInstance, &RegionContext, &[Mutation]) -> Result<()>,
    ) -> Result<()> {
        let table = self.directory.region(partition)?.table;
        let mut pending = mutations;
        let mut attempt = 0u32;
        while !pending.is_empty() {
            let mut groups: BTreeMap<PartitionId, Vec<Mutation>> = BTreeMap::new();
            for m in pending {
                let owner = self.directory.locate(table, &m.key)?.id;
                groups.entry(owner).or_default().push(m);
            }
            pending = Vec::new();
            for (owner, batch) in groups {
                match self.call(owner, |store, region| op(store, region, &batch)) {
                    Ok(()) => {}
                    Err(err)
                        if err.store_code() == Some(StoreErrorCode::KeyOutOfRange)
                            && attempt < self.max_retries =>
                    {
                        debug!(
                            partition_id = %owner,
                            keys = batch.len(),
                            operator = "RegionRouter",
                            "regrouping keys after a split: {err}"
                        );
                        pending.extend(batch);
                    }
                    Err(err) => return Err(err),
                }
            }
            if !pending.is_empty() {
                attempt += 1;
                self.refresh_table(table)?;
            }
        }
        Ok(())
    }

    /// Reads one page of `range` in `table` from the region owning `range.start`.
    ///
    /// The page never crosses a region boundary. Its `resume` key is where the next page
    /// starts, which is the owning region's end key once that region is drained; a split
    /// between pages therefore only moves rows to a region the caller visits later.
    pub fn scan_page(&self, table: TableId, range: &KeyRange, limit: usize) -> Result<ScanPage> {
        let limit = limit.max(1);
        let (rows, region_end) = self.call_resolved(
            |dir| dir.locate(table, &range.start),
            |store, region| {
                let rows = match region.clamp(range) {
                    Some(bounded) => store.scan(&region.context(), &bounded, limit)?,
                    None => Vec::new(),
                };
                Ok((rows, region.end_key.clone()))
            },
        )?;
        let resume = if rows.len() >= limit {
            rows.last().map(|kv| {
                // Smallest key strictly greater than the last one returned.
                let mut next = kv.key.clone();
                next.push(0);
                next
            })
        } else if region_end.is_empty()
            || (!range.end.is_empty() && region_end.as_slice() >= range.end.as_slice())
        {
            None
        } else {
            Some(region_end)
        };
        Ok(ScanPage { rows, resume })
    }

    /// Replaces every cached region of `table` with the route source's view.
    pub fn refresh_table(&self, table: TableId) -> Result<()> {
        let regions = self.routes.fetch_table_regions(table)?;
        let known = regions.iter().map(|r| r.id).collect::<Vec<_>>();
        for stale in self.directory.table_regions(table) {
            if !known.contains(&stale.id) {
                self.directory.evict(stale.id);
            }
        }
        self.directory.refresh(regions);
        Ok(())
    }

    fn repair(&self, partition: PartitionId, seen: &RegionDescriptor, class: ErrorClass) -> Result<()> {
        match class {
            ErrorClass::PeerInvalid => {
                let leader = self.routes.fetch_leader(partition)?;
                self.directory.update_leader(partition, leader)
            }
            ErrorClass::EpochInvalid => self.refresh_table(seen.table),
            ErrorClass::Other => Ok(()),
        }
    }
}
