//! Per-leaf bindings used by [`RenderVisitor`].

use dtx_common::{DtxError, Location, PartitionId, Result};
use dtx_execution::{
    CommitParam, OperatorParams, Output, PreWriteParam, RollbackParam, RootParam, ScanCacheParam,
    StreamConverterParam,
};
use tracing::trace;

use crate::element::{MutationLeaf, RootLeaf, ScanCacheLeaf, StreamConverterLeaf};
use crate::render::RenderVisitor;
use crate::transaction::Phase;

/// Node running a participant's vertices: its channel when the transaction is distributed,
/// the coordinator otherwise.
fn placement(v: &RenderVisitor<'_>, partition: PartitionId) -> Result<Location> {
    if v.txn.channel_map().is_empty() {
        return Ok(v.current_location.clone());
    }
    v.txn
        .channel(partition)
        .map(|c| c.location.clone())
        .ok_or_else(|| {
            DtxError::MalformedPlan(format!(
                "participant {partition} of {} has no channel",
                v.txn.id()
            ))
        })
}

fn input_partition(input: &Output) -> Result<PartitionId> {
    input.hint.partition.ok_or_else(|| {
        DtxError::MalformedPlan(format!(
            "output {}#{} carries no partition",
            input.id.producer, input.id.index
        ))
    })
}

pub(crate) fn scan_cache(v: &mut RenderVisitor<'_>, leaf: &ScanCacheLeaf) -> Result<Vec<Output>> {
    let inputs = v.visit(&leaf.data)?;
    if !inputs.is_empty() {
        return Err(DtxError::MalformedPlan(
            "scan cache leaf must be a source".to_string(),
        ));
    }
    let mut outputs = Vec::new();
    for partition in v.txn.participants() {
        let location = placement(v, partition)?;
        let id = v.job.add_vertex(
            location,
            OperatorParams::ScanCache(ScanCacheParam {
                partition,
                rows: v.txn.mutations(partition),
            }),
        );
        trace!(vertex = %id, partition_id = %partition, "bound scan cache");
        outputs.push(v.job.add_output(id, Some(partition))?);
    }
    Ok(outputs)
}

fn mutation_params(
    v: &RenderVisitor<'_>,
    phase: Phase,
    partition: PartitionId,
) -> Result<OperatorParams> {
    let start_ts = v.txn.start_ts();
    Ok(match phase {
        Phase::PreWrite => OperatorParams::PreWrite(PreWriteParam {
            partition,
            start_ts,
            primary_key: v
                .txn
                .primary_key()
                .ok_or_else(|| {
                    DtxError::Planning(format!("{} has no primary key", v.txn.id()))
                })?
                .to_vec(),
            lock_ttl_ms: v.config.lock_ttl_ms,
        }),
        Phase::Commit => OperatorParams::Commit(CommitParam {
            partition,
            start_ts,
            commit_ts: v.txn.commit_ts().ok_or_else(|| {
                DtxError::Planning(format!("{} has no commit timestamp", v.txn.id()))
            })?,
        }),
        Phase::Rollback => OperatorParams::Rollback(RollbackParam {
            partition,
            start_ts,
        }),
    })
}

/// One mutation vertex per input, placed where its input runs.
pub(crate) fn mutation(
    v: &mut RenderVisitor<'_>,
    phase: Phase,
    leaf: &MutationLeaf,
) -> Result<Vec<Output>> {
    let inputs = v.visit(&leaf.data)?;
    if leaf.sink && inputs.len() != 1 {
        return Err(DtxError::MalformedPlan(format!(
            "sink {phase} leaf needs exactly one input, got {}",
            inputs.len()
        )));
    }
    let mut outputs = Vec::new();
    for input in inputs {
        let partition = input_partition(&input)?;
        let params = mutation_params(v, phase, partition)?;
        let id = v.job.add_vertex(input.hint.location.clone(), params);
        v.job.link(input.id, id)?;
        if leaf.sink {
            v.job.set_root(id)?;
        } else {
            outputs.push(v.job.add_output(id, Some(partition))?);
        }
    }
    Ok(outputs)
}

pub(crate) fn stream_converter(
    v: &mut RenderVisitor<'_>,
    leaf: &StreamConverterLeaf,
) -> Result<Vec<Output>> {
    let inputs = v.visit(&leaf.data)?;
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let partition = input_partition(&input)?;
        let id = v.job.add_vertex(
            v.current_location.clone(),
            OperatorParams::StreamConverter(StreamConverterParam { partition }),
        );
        v.job.link(input.id, id)?;
        outputs.push(v.job.add_output(id, Some(partition))?);
    }
    Ok(outputs)
}

/// The coordinator: consumes every input and becomes the job root.
pub(crate) fn root(v: &mut RenderVisitor<'_>, leaf: &RootLeaf) -> Result<Vec<Output>> {
    let inputs = v.visit(&leaf.data)?;
    if inputs.is_empty() {
        return Err(DtxError::MalformedPlan(
            "root leaf has no inputs".to_string(),
        ));
    }
    let id = v.job.add_vertex(
        v.current_location.clone(),
        OperatorParams::Root(RootParam {
            participants: inputs.len(),
        }),
    );
    for input in &inputs {
        v.job.link(input.id, id)?;
    }
    v.job.set_root(id)?;
    Ok(Vec::new())
}
