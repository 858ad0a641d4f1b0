//! Store instance contract: the per-partition primitives operators read and write through.

use std::sync::Arc;

use dtx_common::{PartitionId, Result};
use serde::{Deserialize, Serialize};

use crate::region::{KeyRange, RegionContext};

/// One raw key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Write operation kind carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOp {
    Put,
    Delete,
}

impl MutationOp {
    pub fn code(self) -> i64 {
        match self {
            MutationOp::Put => 1,
            MutationOp::Delete => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MutationOp::Put),
            2 => Some(MutationOp::Delete),
            _ => None,
        }
    }
}

/// A single buffered write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub key: Vec<u8>,
    /// Absent for deletes.
    pub value: Option<Vec<u8>>,
}

/// First phase: lock keys and stage their values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewriteRequest {
    pub start_ts: u64,
    pub primary_key: Vec<u8>,
    pub mutations: Vec<Mutation>,
    pub lock_ttl_ms: u64,
}

/// Second phase: make staged values visible at `commit_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub keys: Vec<Vec<u8>>,
}

/// Compensation: release locks and discard anything written by `start_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub start_ts: u64,
    pub keys: Vec<Vec<u8>>,
}

/// Per-partition store front-end, backed by a raft-replicated engine.
///
/// Every call carries the caller's [`RegionContext`]; an instance answers with a routing
/// error code when the header's leader or epoch is stale.
pub trait StoreInstance: Send + Sync {
    fn id(&self) -> PartitionId;

    fn get(&self, ctx: &RegionContext, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` committed pairs from `range`, in key order.
    fn scan(&self, ctx: &RegionContext, range: &KeyRange, limit: usize) -> Result<Vec<KeyValue>>;

    /// Non-transactional write, committed immediately.
    fn put(&self, ctx: &RegionContext, pairs: Vec<KeyValue>) -> Result<()>;

    fn prewrite(&self, ctx: &RegionContext, req: &PrewriteRequest) -> Result<()>;

    fn commit(&self, ctx: &RegionContext, req: &CommitRequest) -> Result<()>;

    fn rollback(&self, ctx: &RegionContext, req: &RollbackRequest) -> Result<()>;
}

/// Node-local registry of store instances keyed by partition.
pub trait StoreService: Send + Sync {
    /// Instance serving `id`, or `None` when this node does not host it.
    fn get_instance(&self, id: PartitionId) -> Option<Arc<dyn StoreInstance>>;

    fn delete_instance(&self, id: PartitionId);
}
