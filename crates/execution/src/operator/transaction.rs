//! Transaction phase operators.
//!
//! Row shapes on the wire:
//! - mutation rows (scan-cache output): `[op code, key, value | null]`
//! - acknowledgements (mutation and converter output): `[partition id, key count]`

use std::sync::Arc;

use dtx_common::{DtxError, PartitionId, Result, Tuple, Value};
use dtx_storage::{
    CommitRequest, Mutation, MutationOp, PrewriteRequest, RegionRouter, RollbackRequest,
};
use tracing::{debug, info};

use super::{Operator, TupleIter, flat_map_tuples};
use crate::context::SharedTaskContext;
use crate::dag::Vertex;
use crate::params::{
    CommitParam, PreWriteParam, RollbackParam, RootParam, ScanCacheParam, StreamConverterParam,
};

/// Encodes one buffered mutation as a row.
pub fn mutation_to_tuple(m: &Mutation) -> Tuple {
    vec![
        Value::Int64(m.op.code()),
        Value::Bytes(m.key.clone()),
        m.value.clone().map_or(Value::Null, Value::Bytes),
    ]
}

/// Decodes a mutation row.
pub fn tuple_to_mutation(t: &[Value]) -> Result<Mutation> {
    let bad = || DtxError::Execution(format!("malformed mutation row of arity {}", t.len()));
    let [op, key, value] = t else {
        return Err(bad());
    };
    let op = op.as_i64().and_then(MutationOp::from_code).ok_or_else(bad)?;
    let key = key.as_bytes().ok_or_else(bad)?.to_vec();
    let value = match (op, value) {
        (MutationOp::Put, Value::Bytes(v)) => Some(v.clone()),
        (MutationOp::Delete, Value::Null) => None,
        _ => return Err(bad()),
    };
    Ok(Mutation { op, key, value })
}

/// Acknowledgement row of one partition.
pub fn ack_tuple(partition: PartitionId, count: usize) -> Tuple {
    vec![Value::Int64(partition.0 as i64), Value::Int64(count as i64)]
}

/// Decodes an acknowledgement row.
pub fn parse_ack(t: &[Value]) -> Result<(PartitionId, u64)> {
    match t {
        [Value::Int64(p), Value::Int64(n)] if *p >= 0 && *n >= 0 => {
            Ok((PartitionId(*p as u64), *n as u64))
        }
        _ => Err(DtxError::Execution(format!(
            "malformed acknowledgement row of arity {}",
            t.len()
        ))),
    }
}

/// Replays the transaction's buffered rows of one partition.
#[derive(Debug, Clone)]
pub struct ScanCacheOperator {
    param: Arc<ScanCacheParam>,
}

impl ScanCacheOperator {
    /// Operator over `param.rows`.
    pub fn new(param: ScanCacheParam) -> Self {
        Self {
            param: Arc::new(param),
        }
    }
}

impl Operator for ScanCacheOperator {
    fn name(&self) -> &'static str {
        "ScanCache"
    }

    fn execute(
        self: Arc<Self>,
        _ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let param = Arc::clone(&self.param);
        Ok(flat_map_tuples(upstream, move |_seed| {
            let rows = param
                .rows
                .iter()
                .map(|m| Ok(mutation_to_tuple(m)))
                .collect::<Vec<_>>();
            Ok(Box::new(rows.into_iter()) as TupleIter)
        }))
    }
}

/// Drains the whole upstream, then runs the store request for the partition's keys, split
/// per owning region if the partition has split since rendering.
fn apply_batch<F>(
    ctx: SharedTaskContext,
    upstream: TupleIter,
    partition: PartitionId,
    phase: &'static str,
    request: F,
) -> Result<TupleIter>
where
    F: FnOnce(&RegionRouter, Vec<Mutation>) -> Result<()> + Send + 'static,
{
    let router = Arc::clone(ctx.router()?);
    Ok(Box::new(std::iter::once_with(move || {
        let mutations = upstream
            .map(|item| item.and_then(|t| tuple_to_mutation(&t)))
            .collect::<Result<Vec<_>>>()?;
        let count = mutations.len();
        if count > 0 {
            ctx.cancel.check(phase)?;
            request(&router, mutations)?;
        }
        debug!(
            job_id = %ctx.job_id,
            partition_id = %partition,
            keys = count,
            operator = phase,
            "phase applied"
        );
        Ok(ack_tuple(partition, count))
    })))
}

/// Locks and stages one partition's mutations.
#[derive(Debug, Clone)]
pub struct PreWriteOperator {
    param: PreWriteParam,
}

impl PreWriteOperator {
    /// Operator for one partition.
    pub fn new(param: PreWriteParam) -> Self {
        Self { param }
    }
}

impl Operator for PreWriteOperator {
    fn name(&self) -> &'static str {
        "PreWrite"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let p = self.param.clone();
        apply_batch(ctx, upstream, p.partition, "PreWrite", move |router, mutations| {
            router.call_batch(p.partition, mutations, |store, region, batch| {
                let req = PrewriteRequest {
                    start_ts: p.start_ts,
                    primary_key: p.primary_key.clone(),
                    mutations: batch.to_vec(),
                    lock_ttl_ms: p.lock_ttl_ms,
                };
                store.prewrite(region, &req)
            })
        })
    }
}

/// Commits one partition's staged keys.
#[derive(Debug, Clone)]
pub struct CommitOperator {
    param: CommitParam,
}

impl CommitOperator {
    /// Operator for one partition.
    pub fn new(param: CommitParam) -> Self {
        Self { param }
    }
}

impl Operator for CommitOperator {
    fn name(&self) -> &'static str {
        "Commit"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let p = self.param.clone();
        apply_batch(ctx, upstream, p.partition, "Commit", move |router, mutations| {
            router.call_batch(p.partition, mutations, |store, region, batch| {
                let req = CommitRequest {
                    start_ts: p.start_ts,
                    commit_ts: p.commit_ts,
                    keys: batch.iter().map(|m| m.key.clone()).collect(),
                };
                store.commit(region, &req)
            })
        })
    }
}

/// Rolls back one partition; removes locks and anything committed by the transaction.
#[derive(Debug, Clone)]
pub struct RollbackOperator {
    param: RollbackParam,
}

impl RollbackOperator {
    /// Operator for one partition.
    pub fn new(param: RollbackParam) -> Self {
        Self { param }
    }
}

impl Operator for RollbackOperator {
    fn name(&self) -> &'static str {
        "Rollback"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let p = self.param.clone();
        apply_batch(ctx, upstream, p.partition, "Rollback", move |router, mutations| {
            router.call_batch(p.partition, mutations, |store, region, batch| {
                let req = RollbackRequest {
                    start_ts: p.start_ts,
                    keys: batch.iter().map(|m| m.key.clone()).collect(),
                };
                store.rollback(region, &req)
            })
        })
    }
}

/// Forwards a participant's acknowledgements to the coordinator node.
#[derive(Debug, Clone)]
pub struct StreamConverterOperator {
    param: StreamConverterParam,
}

impl StreamConverterOperator {
    /// Converter for one partition's stream.
    pub fn new(param: StreamConverterParam) -> Self {
        Self { param }
    }
}

impl Operator for StreamConverterOperator {
    fn name(&self) -> &'static str {
        "StreamConverter"
    }

    fn execute(
        self: Arc<Self>,
        _ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let expected = self.param.partition;
        Ok(Box::new(upstream.map(move |item| {
            let tuple = item?;
            let (partition, _) = parse_ack(&tuple)?;
            if partition != expected {
                return Err(DtxError::Execution(format!(
                    "converter for {expected} received acknowledgement of {partition}"
                )));
            }
            Ok(tuple)
        })))
    }
}

/// Coordinator vertex: gathers one acknowledgement per participant.
#[derive(Debug, Clone)]
pub struct RootOperator {
    param: RootParam,
}

impl RootOperator {
    /// Root expecting `param.participants` acknowledgements.
    pub fn new(param: RootParam) -> Self {
        Self { param }
    }
}

impl Operator for RootOperator {
    fn name(&self) -> &'static str {
        "Root"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        Ok(Box::new(RootGather {
            ctx,
            upstream,
            expected: self.param.participants,
            seen: 0,
            keys: 0,
            finished: false,
        }))
    }
}

struct RootGather {
    ctx: SharedTaskContext,
    upstream: TupleIter,
    expected: usize,
    seen: usize,
    keys: u64,
    finished: bool,
}

impl Iterator for RootGather {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.upstream.next() {
            Some(Ok(tuple)) => match parse_ack(&tuple) {
                Ok((_, n)) => {
                    self.seen += 1;
                    self.keys += n;
                    Some(Ok(tuple))
                }
                Err(e) => {
                    self.finished = true;
                    Some(Err(e))
                }
            },
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                if self.seen != self.expected {
                    return Some(Err(DtxError::Execution(format!(
                        "root gathered {} of {} participant acknowledgements",
                        self.seen, self.expected
                    ))));
                }
                info!(
                    job_id = %self.ctx.job_id,
                    participants = self.seen,
                    keys = self.keys,
                    operator = "Root",
                    "all participants acknowledged"
                );
                None
            }
        }
    }
}
