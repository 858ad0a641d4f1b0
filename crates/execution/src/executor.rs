//! Local job executor.
//!
//! Every vertex runs on its own blocking task. Edges are bounded channels, one inbox per
//! consuming vertex, so a slow consumer back-pressures its producers. The first failing
//! vertex cancels the job: it trips the shared [`CancelToken`] and pushes a `Canceled`
//! error to its consumers, which stop at their next pull.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dtx_common::{DtxError, Result, Tuple, VertexId};
use futures::SinkExt;
use futures::channel::mpsc;
use futures::executor::{block_on, block_on_stream};
use tracing::{debug, info, warn};

use crate::context::{CancelToken, SharedTaskContext};
use crate::dag::{Job, Vertex};
use crate::operator::{Route, TupleIter, create_operator};
use crate::profile::OperatorProfile;

type TupleSender = mpsc::Sender<Result<Tuple>>;

/// Rows produced by a job's sinks plus one profile per vertex.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    /// Sink rows, concatenated in sink vertex id order.
    pub rows: Vec<Tuple>,
    /// Profiles of vertices that finished, in vertex id order.
    pub profiles: Vec<OperatorProfile>,
}

struct VertexRun {
    id: VertexId,
    sink: bool,
    rows: Vec<Tuple>,
    profile: OperatorProfile,
}

/// Upstream wrapper: checks cancellation before every pull and counts pulled rows.
struct Inbound {
    inner: TupleIter,
    cancel: CancelToken,
    what: String,
    rows_in: Arc<AtomicU64>,
    done: bool,
}

impl Iterator for Inbound {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.cancel.check(&self.what) {
            self.done = true;
            return Some(Err(e));
        }
        match self.inner.next() {
            Some(Ok(t)) => {
                self.rows_in.fetch_add(1, Ordering::Relaxed);
                Some(Ok(t))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                // A closed inbox on a canceled job is a truncated stream, not a finished one.
                self.cancel.check(&self.what).err().map(Err)
            }
        }
    }
}

/// Runs `job` to completion on the current node.
///
/// Returns the first error that is not a cancellation echo when any vertex fails.
pub async fn execute_job(job: Arc<Job>, ctx: SharedTaskContext) -> Result<JobResult> {
    job.validate()?;
    let capacity = ctx.config.exchange_channel_capacity;

    let mut senders: HashMap<VertexId, TupleSender> = HashMap::new();
    let mut inboxes: HashMap<VertexId, mpsc::Receiver<Result<Tuple>>> = HashMap::new();
    for v in job.vertices() {
        if !job.inputs_of(v.id).is_empty() {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(v.id, tx);
            inboxes.insert(v.id, rx);
        }
    }

    let mut handles = Vec::with_capacity(job.len());
    for v in job.vertices() {
        let outputs = v
            .outputs
            .iter()
            .map(|o| {
                o.consumers
                    .iter()
                    .map(|c| {
                        senders.get(c).cloned().ok_or_else(|| {
                            DtxError::MalformedPlan(format!("{c} has no inbox"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let inbound: TupleIter = match inboxes.remove(&v.id) {
            Some(rx) => Box::new(block_on_stream(rx)),
            None => Box::new(std::iter::once(Ok(Vec::new()))),
        };
        let vertex = Arc::new(v.clone());
        let ctx = Arc::clone(&ctx);
        let id = v.id;
        handles.push((
            id,
            tokio::task::spawn_blocking(move || run_vertex(ctx, vertex, inbound, outputs)),
        ));
    }
    // Inboxes close once every producer holding a clone is done.
    drop(senders);

    let ids = handles.iter().map(|(id, _)| *id).collect::<Vec<_>>();
    let joined = futures::future::join_all(handles.into_iter().map(|(_, h)| h)).await;

    let mut runs = Vec::new();
    let mut first_error: Option<DtxError> = None;
    for (id, joined) in ids.into_iter().zip(joined) {
        let outcome = joined
            .map_err(|e| DtxError::Execution(format!("vertex {id} task failed: {e}")))
            .and_then(|r| r);
        match outcome {
            Ok(run) => runs.push(run),
            Err(e) => {
                let replace = match &first_error {
                    None => true,
                    Some(DtxError::Canceled(_)) => !matches!(e, DtxError::Canceled(_)),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        warn!(job_id = %ctx.job_id, error = %e, "job failed");
        return Err(e);
    }

    runs.sort_by_key(|r| r.id);
    let mut result = JobResult::default();
    for run in runs {
        if run.sink {
            result.rows.extend(run.rows);
        }
        result.profiles.push(run.profile);
    }
    info!(
        job_id = %ctx.job_id,
        vertices = result.profiles.len(),
        rows = result.rows.len(),
        "job finished"
    );
    Ok(result)
}

fn run_vertex(
    ctx: SharedTaskContext,
    vertex: Arc<Vertex>,
    inbound: TupleIter,
    mut outputs: Vec<Vec<TupleSender>>,
) -> Result<VertexRun> {
    let op = create_operator(&vertex.params)?;
    let mut profile = OperatorProfile::new(op.name(), vertex.id, vertex.location.clone());
    let rows_in = Arc::new(AtomicU64::new(0));
    let upstream = Box::new(Inbound {
        inner: inbound,
        cancel: ctx.cancel.clone(),
        what: format!("{} {}", op.name(), vertex.id),
        rows_in: Arc::clone(&rows_in),
        done: false,
    });
    let sink = vertex.is_sink();

    let drive = |profile: &mut OperatorProfile, outputs: &mut Vec<Vec<TupleSender>>| {
        let mut out = Arc::clone(&op).execute(Arc::clone(&ctx), Arc::clone(&vertex), upstream)?;
        let mut collected = Vec::new();
        loop {
            let start = Instant::now();
            let Some(item) = out.next() else {
                break;
            };
            profile.time(start);
            let tuple = item?;
            profile.rows_out += 1;
            if sink {
                collected.push(tuple);
                continue;
            }
            match op.route(&tuple, outputs.len())? {
                Route::All => {
                    for tx in outputs.iter_mut().flatten() {
                        send(tx, Ok(tuple.clone()), vertex.id)?;
                    }
                }
                Route::One(i) => {
                    let targets = outputs.get_mut(i).ok_or_else(|| {
                        DtxError::MalformedPlan(format!("{} has no output #{i}", vertex.id))
                    })?;
                    for tx in targets.iter_mut() {
                        send(tx, Ok(tuple.clone()), vertex.id)?;
                    }
                }
            }
        }
        Ok::<_, DtxError>(collected)
    };

    let outcome = drive(&mut profile, &mut outputs);
    profile.rows_in = rows_in.load(Ordering::Relaxed);
    profile.end(&ctx);
    match outcome {
        Ok(rows) => {
            debug!(job_id = %ctx.job_id, vertex = %vertex.id, profile = %profile, "vertex finished");
            Ok(VertexRun {
                id: vertex.id,
                sink,
                rows,
                profile,
            })
        }
        Err(e) => {
            ctx.cancel.cancel();
            if !matches!(e, DtxError::Canceled(_)) {
                warn!(
                    job_id = %ctx.job_id,
                    vertex = %vertex.id,
                    operator = op.name(),
                    error = %e,
                    "vertex failed; canceling job"
                );
            }
            for tx in outputs.iter_mut().flatten() {
                let _ = block_on(tx.send(Err(DtxError::Canceled(format!(
                    "upstream {} failed",
                    vertex.id
                )))));
            }
            Err(e)
        }
    }
}

fn send(tx: &mut TupleSender, item: Result<Tuple>, from: VertexId) -> Result<()> {
    block_on(tx.send(item))
        .map_err(|_| DtxError::Canceled(format!("consumer of {from} is gone")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dtx_common::{DtxError, EngineConfig, JobId, Location, PartitionId, TupleMapping, Value};
    use dtx_storage::{Mutation, MutationOp};

    use super::execute_job;
    use crate::context::TaskContext;
    use crate::dag::Job;
    use crate::expressions::{BinaryOp, Expr};
    use crate::params::{
        FilterProjectParam, HashParam, HashStrategy, OperatorParams, RootParam, ScanCacheParam,
        SourceParam, StreamConverterParam,
    };

    fn ctx() -> Arc<TaskContext> {
        Arc::new(TaskContext::new(
            JobId { domain: 1, seq: 1 },
            Location::new("n1", 1),
            EngineConfig {
                exchange_channel_capacity: 2,
                ..EngineConfig::default()
            },
        ))
    }

    fn put(i: u8) -> Mutation {
        Mutation {
            op: MutationOp::Put,
            key: vec![i],
            value: Some(vec![i, i]),
        }
    }

    fn at() -> Location {
        Location::new("n1", 1)
    }

    #[tokio::test]
    async fn rows_flow_from_sources_to_the_sink() {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let scan = job.add_vertex(
            at(),
            OperatorParams::ScanCache(ScanCacheParam {
                partition: PartitionId(1),
                rows: (0..10).map(put).collect(),
            }),
        );
        // mutation rows are [op, key, value]; keep op == 1 and select the key only
        let filter = job.add_vertex(
            at(),
            OperatorParams::FilterProject(FilterProjectParam {
                source: SourceParam::Upstream,
                source_arity: 3,
                selection: Some(TupleMapping::new(vec![1, 0], 3).expect("mapping")),
                filter: Some(Expr::col(1).binary(BinaryOp::Eq, Expr::lit(Value::Int64(1)))),
            }),
        );
        let out = job.add_output(scan, None).expect("output");
        job.link(out.id, filter).expect("link");

        let result = execute_job(Arc::new(job), ctx()).await.expect("run");
        assert_eq!(result.rows.len(), 10);
        assert_eq!(result.rows[3], vec![Value::Bytes(vec![3]), Value::Int64(1)]);
        assert_eq!(result.profiles.len(), 2);
        assert_eq!(result.profiles[1].rows_in, 10);
        assert_eq!(result.profiles[1].rows_out, 10);
    }

    #[tokio::test]
    async fn hash_fan_out_partitions_rows_across_consumers() {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let scan = job.add_vertex(
            at(),
            OperatorParams::ScanCache(ScanCacheParam {
                partition: PartitionId(1),
                rows: (0..40).map(put).collect(),
            }),
        );
        let hash = job.add_vertex(
            at(),
            OperatorParams::Hash(HashParam {
                key_mapping: TupleMapping::new(vec![1], 3).expect("mapping"),
                strategy: HashStrategy::Modulo { buckets: 3 },
            }),
        );
        let o = job.add_output(scan, None).expect("output");
        job.link(o.id, hash).expect("link");
        for _ in 0..3 {
            let sink = job.add_vertex(
                at(),
                OperatorParams::FilterProject(FilterProjectParam {
                    source: SourceParam::Upstream,
                    source_arity: 3,
                    selection: None,
                    filter: None,
                }),
            );
            let o = job.add_output(hash, None).expect("output");
            job.link(o.id, sink).expect("link");
        }
        let result = execute_job(Arc::new(job), ctx()).await.expect("run");
        assert_eq!(result.rows.len(), 40);
        let mut keys = result
            .rows
            .iter()
            .map(|r| r[1].as_bytes().expect("key")[0])
            .collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, (0..40).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn a_failing_vertex_fails_the_job_with_its_own_error() {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let root = job.add_vertex(at(), OperatorParams::Root(RootParam { participants: 1 }));
        let scan = job.add_vertex(
            at(),
            OperatorParams::ScanCache(ScanCacheParam {
                partition: PartitionId(2),
                rows: (0..50).map(put).collect(),
            }),
        );
        // a converter fed mutation rows instead of acknowledgements fails on the first row
        let conv = job.add_vertex(
            at(),
            OperatorParams::StreamConverter(StreamConverterParam {
                partition: PartitionId(2),
            }),
        );
        let o = job.add_output(scan, None).expect("output");
        job.link(o.id, conv).expect("link");
        let o = job.add_output(conv, None).expect("output");
        job.link(o.id, root).expect("link");
        job.set_root(root).expect("root");

        let ctx = ctx();
        let err = execute_job(Arc::new(job), Arc::clone(&ctx))
            .await
            .expect_err("must fail");
        assert!(matches!(err, DtxError::Execution(_)), "{err}");
        assert!(ctx.cancel.is_canceled());
    }

    #[tokio::test]
    async fn malformed_jobs_are_rejected_before_dispatch() {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let scan = job.add_vertex(
            at(),
            OperatorParams::ScanCache(ScanCacheParam {
                partition: PartitionId(1),
                rows: Vec::new(),
            }),
        );
        job.add_output(scan, None).expect("dangling output");
        let err = execute_job(Arc::new(job), ctx()).await.expect_err("dangling");
        assert!(matches!(err, DtxError::MalformedPlan(_)));
    }
}
