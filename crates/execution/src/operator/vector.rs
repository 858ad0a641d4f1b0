//! Vector-distance scatter/gather operators.

use std::sync::Arc;

use dtx_common::{DtxError, Result, Tuple, Value};
use dtx_storage::TableCodec;
use tracing::debug;

use super::filter_project::ScanPager;
use super::{Operator, TupleIter, flat_map_tuples};
use crate::context::SharedTaskContext;
use crate::dag::Vertex;
use crate::params::{TopKParam, VectorPointDistanceParam};

/// Scores every row of one region against the query vector and keeps the closest `top_n`.
///
/// Output rows are the stored row with a trailing `Float64` distance column.
#[derive(Debug, Clone)]
pub struct VectorPointDistanceOperator {
    param: VectorPointDistanceParam,
}

impl VectorPointDistanceOperator {
    /// Operator for one region.
    pub fn new(param: VectorPointDistanceParam) -> Self {
        Self { param }
    }
}

/// One probe: scan, score and rank the region's rows.
fn probe(
    ctx: &SharedTaskContext,
    param: &mut VectorPointDistanceParam,
    codec: &TableCodec,
) -> Result<Vec<(Tuple, f32)>> {
    let Some(range) = param.region.clamp(&codec.range()) else {
        return Ok(Vec::new());
    };
    let router = Arc::clone(ctx.router()?);
    // Follows the rendered region's range even if the region has split since.
    let pager = ScanPager::new(Arc::clone(ctx), router, param.region.table, range);
    let column = param.vector_column;
    let dimension = param.dimension;
    let metric = param.metric;
    let query = param.target_vector.clone();
    let top_n = param.top_n;
    let cache = param.begin_probe();
    for item in pager {
        let (_, bytes) = item?;
        let row = codec.decode_row(&bytes)?;
        let Some(vector) = row.get(column).and_then(Value::as_vector) else {
            continue;
        };
        if vector.len() != dimension {
            return Err(DtxError::Execution(format!(
                "stored vector has dimension {}, expected {dimension}",
                vector.len()
            )));
        }
        let distance = ctx.tools.distance.distance(metric, &query, vector)?;
        cache.push(row, distance);
    }
    let candidates = param.cache_mut().len();
    debug!(
        job_id = %ctx.job_id,
        partition_id = %param.region.id,
        candidates,
        top_n,
        operator = "VectorPointDistance",
        "region probed"
    );
    Ok(param.cache_mut().drain_top(top_n))
}

impl Operator for VectorPointDistanceOperator {
    fn name(&self) -> &'static str {
        "VectorPointDistance"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let mut param = self.param.clone();
        let codec = TableCodec::new(param.index_table_id, param.schema.clone())?;
        Ok(flat_map_tuples(upstream, move |_trigger| {
            let rows = probe(&ctx, &mut param, &codec)?
                .into_iter()
                .map(|(mut row, distance)| {
                    row.push(Value::Float64(f64::from(distance)));
                    Ok(row)
                })
                .collect::<Vec<_>>();
            Ok(Box::new(rows.into_iter()) as TupleIter)
        }))
    }
}

/// Merges per-region candidates into the global closest `k`.
#[derive(Debug, Clone)]
pub struct TopKOperator {
    param: TopKParam,
}

impl TopKOperator {
    /// Gather operator keeping `param.k` rows.
    pub fn new(param: TopKParam) -> Self {
        Self { param }
    }
}

impl Operator for TopKOperator {
    fn name(&self) -> &'static str {
        "TopK"
    }

    fn execute(
        self: Arc<Self>,
        _ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        let TopKParam { k, distance_column } = self.param.clone();
        Ok(Box::new(
            std::iter::once_with(move || -> Result<Vec<Tuple>> {
                let mut rows = upstream
                    .map(|item| {
                        let row = item?;
                        let d = row.get(distance_column).and_then(Value::as_f64).ok_or_else(|| {
                            DtxError::Execution(format!(
                                "row has no distance in column #{distance_column}"
                            ))
                        })?;
                        Ok((d, row))
                    })
                    .collect::<Result<Vec<_>>>()?;
                rows.sort_by(|a, b| a.0.total_cmp(&b.0));
                rows.truncate(k);
                Ok(rows.into_iter().map(|(_, row)| row).collect())
            })
            .flat_map(|batch| -> TupleIter {
                match batch {
                    Ok(rows) => Box::new(rows.into_iter().map(Ok)),
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dtx_common::{
        ColumnDef, DataType, EngineConfig, IndexId, JobId, Location, PartitionId, TableId,
        TupleSchema, Value,
    };
    use dtx_storage::{
        AlgorithmType, KeyValue, MemoryStoreService, MetricType, PartitionDirectory,
        RegionDescriptor, RegionEpoch, RegionRouter, StoreInstance, TableCodec,
    };

    use super::{TopKOperator, VectorPointDistanceOperator};
    use crate::context::TaskContext;
    use crate::dag::Job;
    use crate::operator::{Operator, TupleIter};
    use crate::params::{OperatorParams, TopKParam, VectorPointDistanceParam};

    fn schema() -> TupleSchema {
        TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("v", DataType::VectorF32(2)),
        ])
    }

    fn region() -> RegionDescriptor {
        RegionDescriptor {
            id: PartitionId(1),
            table: TableId(9),
            start_key: Vec::new(),
            end_key: Vec::new(),
            leader: Location::new("n1", 1),
            peers: vec![Location::new("n1", 1)],
            epoch: RegionEpoch::new(1, 1),
        }
    }

    fn param(top_n: usize) -> VectorPointDistanceParam {
        VectorPointDistanceParam::new(
            region(),
            IndexId(3),
            TableId(9),
            schema(),
            1,
            vec![0.0, 0.0],
            AlgorithmType::Flat,
            MetricType::L2,
            top_n,
        )
        .expect("param")
    }

    fn vertex(params: OperatorParams) -> Arc<crate::dag::Vertex> {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let id = job.add_vertex(Location::new("n1", 1), params);
        Arc::new(job.vertex(id).expect("vertex").clone())
    }

    fn seeded_ctx() -> Arc<TaskContext> {
        seeded().1
    }

    fn seeded() -> (Arc<MemoryStoreService>, Arc<TaskContext>) {
        let codec = TableCodec::new(TableId(9), schema()).expect("codec");
        let svc = Arc::new(MemoryStoreService::new());
        let store = svc.add_region(region()).expect("add");
        let pairs = (0..6)
            .map(|i| {
                let row = vec![Value::Int64(i), Value::VectorF32(vec![i as f32, 0.0])];
                KeyValue {
                    key: codec.encode_key(&row).expect("key"),
                    value: codec.encode_row(&row).expect("row"),
                }
            })
            .collect();
        store.put(&region().context(), pairs).expect("put");
        let config = EngineConfig {
            scan_page_rows: 4,
            retry_backoff_base_ms: 0,
            ..EngineConfig::default()
        };
        let router = Arc::new(RegionRouter::new(
            Arc::new(PartitionDirectory::from_regions([region()])),
            svc.clone(),
            svc.clone(),
            &config,
        ));
        let ctx = Arc::new(
            TaskContext::new(JobId { domain: 1, seq: 1 }, Location::new("n1", 1), config)
                .with_router(router),
        );
        (svc, ctx)
    }

    #[test]
    fn raw_cache_reuse_leaks_rows_between_probes() {
        let mut p = param(10);
        p.cache_mut().push(vec![Value::Int64(1)], 1.0);
        p.cache_mut().push(vec![Value::Int64(2)], 2.0);
        // a second probe through the raw accessor sees the first probe's rows
        p.cache_mut().push(vec![Value::Int64(3)], 0.5);
        assert_eq!(p.cache_mut().len(), 3);

        let cache = p.begin_probe();
        assert!(cache.is_empty());
        cache.push(vec![Value::Int64(3)], 0.5);
        assert_eq!(p.cache_mut().drain_top(10).len(), 1);
        assert!(p.cache_mut().is_empty());
    }

    #[test]
    fn repeated_probes_return_identical_rows() {
        let ctx = seeded_ctx();
        let p = param(2);
        let op = Arc::new(VectorPointDistanceOperator::new(p.clone()));
        // two triggers on one vertex run two probes over the same state
        let upstream: TupleIter = Box::new(vec![Ok(Vec::new()), Ok(Vec::new())].into_iter());
        let rows = op
            .execute(ctx, vertex(OperatorParams::VectorPointDistance(p)), upstream)
            .expect("execute")
            .collect::<dtx_common::Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[..2], rows[2..]);
        assert_eq!(rows[0][0], Value::Int64(0));
        assert_eq!(rows[1][0], Value::Int64(1));
        assert_eq!(rows[1][2], Value::Float64(1.0));
    }

    #[test]
    fn region_rows_moved_by_a_split_are_still_scored() {
        let (svc, ctx) = seeded();
        let at = TableCodec::new(TableId(9), schema())
            .expect("codec")
            .encode_primary_key(&[Value::Int64(3)])
            .expect("split key");
        svc.split_region(PartitionId(1), &at, PartitionId(2))
            .expect("split");
        let p = param(6);
        let op = Arc::new(VectorPointDistanceOperator::new(p.clone()));
        let upstream: TupleIter = Box::new(std::iter::once(Ok(Vec::new())));
        let ids = op
            .execute(ctx, vertex(OperatorParams::VectorPointDistance(p)), upstream)
            .expect("execute")
            .map(|r| r.expect("row")[0].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, (0..6).map(Value::Int64).collect::<Vec<_>>());
    }

    #[test]
    fn top_k_merges_by_distance() {
        let ctx = seeded_ctx();
        let p = TopKParam {
            k: 3,
            distance_column: 1,
        };
        let op = Arc::new(TopKOperator::new(p.clone()));
        let input = vec![
            vec![Value::Int64(1), Value::Float64(4.0)],
            vec![Value::Int64(2), Value::Float64(0.5)],
            vec![Value::Int64(3), Value::Float64(9.0)],
            vec![Value::Int64(4), Value::Float64(1.5)],
        ];
        let upstream: TupleIter = Box::new(input.into_iter().map(Ok));
        let ids = op
            .execute(ctx, vertex(OperatorParams::TopK(p)), upstream)
            .expect("execute")
            .map(|r| r.expect("row")[0].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![Value::Int64(2), Value::Int64(4), Value::Int64(1)]);
    }
}
