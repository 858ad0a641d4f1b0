//! Vector-distance scatter/gather jobs.
//!
//! One distance vertex per region of the indexed table, placed on the region's leader, each
//! keeping its local closest `top_n`; a top-k vertex on the coordinator merges them.

use dtx_common::{DtxError, Location, Result, VertexId};
use dtx_execution::{Job, OperatorParams, TopKParam, VectorPointDistanceParam};
use dtx_storage::{RegionDescriptor, TableDef};
use tracing::debug;

/// Renders a nearest-neighbour search over `regions` and returns the gathering root.
///
/// Result rows are the stored rows with a trailing distance column, closest first.
pub fn render_vector_search(
    job: &mut Job,
    table: &TableDef,
    regions: &[RegionDescriptor],
    query: &[f32],
    top_n: usize,
    current_location: &Location,
) -> Result<VertexId> {
    let index = table.vector_index.as_ref().ok_or_else(|| {
        DtxError::Planning(format!("table '{}' has no vector index", table.name))
    })?;
    let column = table.schema.index_of(&index.column).ok_or_else(|| {
        DtxError::Planning(format!(
            "vector index {} names unknown column '{}'",
            index.id, index.column
        ))
    })?;
    if regions.is_empty() {
        return Err(DtxError::Planning(format!(
            "table '{}' has no regions to search",
            table.name
        )));
    }
    if top_n == 0 {
        return Err(DtxError::Planning("top_n must be positive".to_string()));
    }

    let root = job.add_vertex(
        current_location.clone(),
        OperatorParams::TopK(TopKParam {
            k: top_n,
            distance_column: table.schema.arity(),
        }),
    );
    for region in regions {
        let param = VectorPointDistanceParam::new(
            region.clone(),
            index.id,
            table.id,
            table.schema.clone(),
            column,
            query.to_vec(),
            index.algorithm,
            index.metric,
            top_n,
        )?;
        let id = job.add_vertex(
            region.leader.clone(),
            OperatorParams::VectorPointDistance(param),
        );
        let out = job.add_output(id, Some(region.id))?;
        job.link(out.id, root)?;
    }
    job.set_root(root)?;
    debug!(
        job_id = %job.id(),
        table = %table.name,
        regions = regions.len(),
        top_n,
        "rendered vector search"
    );
    Ok(root)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dtx_common::{
        ColumnDef, DataType, EngineConfig, IndexId, JobId, Location, TableId, TupleSchema, Value,
    };
    use dtx_execution::{Job, TaskContext, VertexKind, execute_job};
    use dtx_storage::{
        AlgorithmType, Catalog, KeyValue, MemoryStoreService, MetricType, PartitionDirectory,
        RegionRouter, StoreInstance, TableDef, VectorIndexDef,
    };

    use super::render_vector_search;

    fn table() -> TableDef {
        TableDef {
            id: TableId(5),
            name: "docs".to_string(),
            schema: TupleSchema::new(vec![
                ColumnDef::key("id", DataType::Int64),
                ColumnDef::new("embedding", DataType::VectorF32(2)),
            ]),
            split_keys: vec![vec![serde_json::json!(50)]],
            vector_index: Some(VectorIndexDef {
                id: IndexId(1),
                column: "embedding".to_string(),
                metric: MetricType::L2,
                algorithm: AlgorithmType::Flat,
            }),
        }
    }

    #[tokio::test]
    async fn nearest_rows_are_gathered_across_regions() {
        let mut catalog = Catalog::new();
        catalog.register_table(table()).expect("register");
        let nodes = [Location::new("n1", 1), Location::new("n2", 1)];
        let regions = catalog.initial_regions(&nodes).expect("regions");
        assert_eq!(regions.len(), 2);

        let svc = Arc::new(MemoryStoreService::new());
        for r in &regions {
            svc.add_region(r.clone()).expect("add");
        }
        let codec = table().codec().expect("codec");
        for id in [3i64, 40, 52, 90] {
            let row = vec![Value::Int64(id), Value::VectorF32(vec![id as f32, 0.0])];
            let key = codec.encode_key(&row).expect("key");
            let region = regions.iter().find(|r| r.contains(&key)).expect("owner");
            svc.store(region.id)
                .expect("store")
                .put(
                    &region.context(),
                    vec![KeyValue {
                        key,
                        value: codec.encode_row(&row).expect("row"),
                    }],
                )
                .expect("put");
        }

        let mut job = Job::new(JobId { domain: 1, seq: 1 << 16 });
        let root = render_vector_search(
            &mut job,
            &table(),
            &regions,
            &[45.0, 0.0],
            2,
            &Location::new("n1", 1),
        )
        .expect("render");
        assert_eq!(job.root(), Some(root));
        assert_eq!(job.vertices_of(VertexKind::VectorPointDistance).len(), 2);
        for v in job.vertices_of(VertexKind::VectorPointDistance) {
            let region = regions
                .iter()
                .find(|r| Some(r.id) == v.params.partition())
                .expect("region");
            assert_eq!(v.location, region.leader);
        }

        let config = EngineConfig::default();
        let router = Arc::new(RegionRouter::new(
            Arc::new(PartitionDirectory::from_regions(regions.clone())),
            svc.clone(),
            svc,
            &config,
        ));
        let ctx = TaskContext::new(job.id(), Location::new("n1", 1), config).with_router(router);
        let result = execute_job(Arc::new(job), Arc::new(ctx)).await.expect("run");
        let ids = result.rows.iter().map(|r| r[0].clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![Value::Int64(40), Value::Int64(52)]);
        assert_eq!(result.rows[0][2], Value::Float64(25.0));
    }

    #[test]
    fn tables_without_an_index_cannot_be_searched() {
        let mut t = table();
        t.vector_index = None;
        let err = render_vector_search(
            &mut Job::new(JobId { domain: 1, seq: 1 }),
            &t,
            &[],
            &[0.0, 0.0],
            1,
            &Location::new("n1", 1),
        )
        .expect_err("no index");
        assert!(matches!(err, dtx_common::DtxError::Planning(_)));
    }
}
