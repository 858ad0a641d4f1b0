//! Filter + projection over a pluggable tuple source.
//!
//! For every upstream tuple the operator asks its [`TupleSource`] for a sequence, remaps each
//! produced tuple through the selection (if any), then keeps it only when the filter
//! evaluates to a non-null `true`. Filter errors and nulls drop the row; they never fail the
//! stream. Output order equals source order.

use std::collections::VecDeque;
use std::sync::Arc;

use dtx_common::{DtxError, Result, TableId, Tuple, TupleMapping, Value};
use dtx_storage::{KeyRange, RegionRouter, TableCodec};
use tracing::debug;

use super::{Operator, TupleIter, flat_map_tuples};
use crate::context::SharedTaskContext;
use crate::dag::Vertex;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::params::{FilterProjectParam, TableScanParam};

/// Source half of a filter/project vertex.
pub trait TupleSource: Send + Sync + 'static {
    /// Source name used in operator names and logs.
    fn name(&self) -> &'static str;

    /// Sequence produced for one upstream tuple.
    fn create_source_iterator(
        &self,
        ctx: &SharedTaskContext,
        tuple: Tuple,
        vertex: &Vertex,
    ) -> Result<TupleIter>;
}

/// Passes each upstream tuple through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpstreamSource;

impl TupleSource for UpstreamSource {
    fn name(&self) -> &'static str {
        "Upstream"
    }

    fn create_source_iterator(
        &self,
        _ctx: &SharedTaskContext,
        tuple: Tuple,
        _vertex: &Vertex,
    ) -> Result<TupleIter> {
        Ok(Box::new(std::iter::once(Ok(tuple))))
    }
}

/// Pages committed rows of the key range rendered for one partition; the upstream tuple is
/// only a trigger. Rows that a split moved out of that partition are still read.
#[derive(Debug, Clone)]
pub struct TableScanSource {
    param: TableScanParam,
    codec: TableCodec,
}

impl TableScanSource {
    /// Binds the scan to its table codec.
    pub fn new(param: TableScanParam) -> Result<Self> {
        let codec = TableCodec::new(param.table, param.schema.clone())?;
        Ok(Self { param, codec })
    }
}

impl TupleSource for TableScanSource {
    fn name(&self) -> &'static str {
        "TableScan"
    }

    fn create_source_iterator(
        &self,
        ctx: &SharedTaskContext,
        _tuple: Tuple,
        _vertex: &Vertex,
    ) -> Result<TupleIter> {
        let router = Arc::clone(ctx.router()?);
        let codec = self.codec.clone();
        let pager = ScanPager::new(
            Arc::clone(ctx),
            router,
            self.param.table,
            self.param.range.clone(),
        );
        Ok(Box::new(pager.map(move |item| {
            item.and_then(|(_, value)| codec.decode_row(&value))
        })))
    }
}

/// Pages `(key, value)` pairs of a table key range through the router.
pub(crate) struct ScanPager {
    ctx: SharedTaskContext,
    router: Arc<RegionRouter>,
    table: TableId,
    range: KeyRange,
    page: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl ScanPager {
    /// Pages through `range` of `table` in key order, following the regions that own it
    /// when the scan starts or later.
    pub(crate) fn new(
        ctx: SharedTaskContext,
        router: Arc<RegionRouter>,
        table: TableId,
        range: KeyRange,
    ) -> Self {
        Self {
            ctx,
            router,
            table,
            range,
            page: VecDeque::new(),
            done: false,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        self.ctx.cancel.check("TableScan")?;
        let limit = self.ctx.config.scan_page_rows;
        let page = self.router.scan_page(self.table, &self.range, limit)?;
        match page.resume {
            Some(next) => self.range.start = next,
            None => self.done = true,
        }
        self.page
            .extend(page.rows.into_iter().map(|kv| (kv.key, kv.value)));
        Ok(())
    }
}

impl Iterator for ScanPager {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.page.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Selection and filter applied on top of a [`TupleSource`].
pub struct FilterProjectOperator<S> {
    source: S,
    selection: Option<TupleMapping>,
    filter: Option<Arc<dyn PhysicalExpr>>,
}

impl<S: TupleSource> FilterProjectOperator<S> {
    /// Compiles the filter against the selected (or source) arity.
    pub fn new(source: S, param: &FilterProjectParam) -> Result<Self> {
        if let Some(sel) = &param.selection {
            if sel.source_arity() != param.source_arity {
                return Err(DtxError::Planning(format!(
                    "selection expects arity {}, source produces {}",
                    sel.source_arity(),
                    param.source_arity
                )));
            }
        }
        let filter_arity = param
            .selection
            .as_ref()
            .map_or(param.source_arity, TupleMapping::len);
        let filter = param
            .filter
            .as_ref()
            .map(|f| compile_expr(f, filter_arity))
            .transpose()?;
        Ok(Self {
            source,
            selection: param.selection.clone(),
            filter,
        })
    }

    /// Lazy output for one upstream tuple.
    pub fn create_iterator(
        &self,
        ctx: &SharedTaskContext,
        tuple: Tuple,
        vertex: &Vertex,
    ) -> Result<TupleIter> {
        let mut iter = self.source.create_source_iterator(ctx, tuple, vertex)?;
        if let Some(selection) = self.selection.clone() {
            iter = Box::new(iter.map(move |item| item.and_then(|t| selection.project(&t))));
        }
        if let Some(filter) = self.filter.clone() {
            let vertex_id = vertex.id;
            iter = Box::new(iter.filter(move |item| match item {
                Err(_) => true,
                Ok(t) => match filter.evaluate(t) {
                    Ok(Value::Boolean(keep)) => keep,
                    Ok(_) => false,
                    Err(e) => {
                        debug!(
                            vertex_id = %vertex_id,
                            operator = "FilterProject",
                            "row excluded by failed filter evaluation: {e}"
                        );
                        false
                    }
                },
            }));
        }
        Ok(iter)
    }
}

impl<S: TupleSource> Operator for FilterProjectOperator<S> {
    fn name(&self) -> &'static str {
        "FilterProject"
    }

    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        Ok(flat_map_tuples(upstream, move |tuple| {
            self.create_iterator(&ctx, tuple, &vertex)
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dtx_common::{
        ColumnDef, DataType, EngineConfig, JobId, Location, PartitionId, TableId, TupleMapping,
        TupleSchema, Value,
    };
    use dtx_storage::{
        KeyValue, MemoryStoreService, PartitionDirectory, RegionDescriptor, RegionEpoch,
        RegionRouter, StoreInstance, TableCodec,
    };

    use super::{FilterProjectOperator, TableScanSource, UpstreamSource};
    use crate::context::TaskContext;
    use crate::dag::Job;
    use crate::expressions::{BinaryOp, Expr};
    use crate::operator::{Operator, TupleIter};
    use crate::params::{FilterProjectParam, OperatorParams, SourceParam, TableScanParam};

    fn ctx() -> Arc<TaskContext> {
        Arc::new(TaskContext::new(
            JobId { domain: 1, seq: 1 },
            Location::new("n1", 1),
            EngineConfig::default(),
        ))
    }

    fn rows() -> Vec<Vec<Value>> {
        vec![
            vec![Value::Int64(1), Value::Utf8("a".into()), Value::Int64(10)],
            vec![Value::Int64(2), Value::Null, Value::Int64(20)],
            vec![Value::Int64(3), Value::Utf8("c".into()), Value::Utf8("bad".into())],
            vec![Value::Int64(4), Value::Utf8("d".into()), Value::Int64(40)],
        ]
    }

    fn run(param: FilterProjectParam, input: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let id = job.add_vertex(
            Location::new("n1", 1),
            OperatorParams::FilterProject(param.clone()),
        );
        let vertex = Arc::new(job.vertex(id).expect("vertex").clone());
        let op = Arc::new(FilterProjectOperator::new(UpstreamSource, &param).expect("op"));
        let upstream: TupleIter = Box::new(input.into_iter().map(Ok));
        op.execute(ctx(), vertex, upstream)
            .expect("execute")
            .collect::<dtx_common::Result<Vec<_>>>()
            .expect("rows")
    }

    fn param(selection: Option<Vec<usize>>, filter: Option<Expr>) -> FilterProjectParam {
        FilterProjectParam {
            source: SourceParam::Upstream,
            source_arity: 3,
            selection: selection.map(|s| TupleMapping::new(s, 3).expect("mapping")),
            filter,
        }
    }

    #[test]
    fn selection_runs_before_filter() {
        // After selecting [2, 0], column 0 is the old column 2.
        let filter = Expr::col(0).binary(BinaryOp::Gt, Expr::lit(Value::Int64(15)));
        let out = run(param(Some(vec![2, 0]), Some(filter)), rows());
        assert_eq!(
            out,
            vec![
                vec![Value::Int64(20), Value::Int64(2)],
                vec![Value::Int64(40), Value::Int64(4)],
            ]
        );
    }

    #[test]
    fn null_and_failed_evaluations_exclude_rows() {
        let filter = Expr::col(1).binary(BinaryOp::NotEq, Expr::lit(Value::Utf8("zz".into())));
        let out = run(param(None, Some(filter)), rows());
        // row 2 has a null name
        assert_eq!(out.len(), 3);

        let numeric = Expr::col(2).binary(BinaryOp::Plus, Expr::lit(Value::Int64(1)))
            .binary(BinaryOp::Gt, Expr::lit(Value::Int64(0)));
        let out = run(param(None, Some(numeric)), rows());
        // row 3 fails arithmetic on a string
        assert_eq!(
            out.iter().map(|r| r[0].clone()).collect::<Vec<_>>(),
            vec![Value::Int64(1), Value::Int64(2), Value::Int64(4)]
        );
    }

    #[test]
    fn filtered_output_is_an_ordered_subsequence_of_unfiltered_output() {
        let filter = Expr::col(0).binary(BinaryOp::GtEq, Expr::lit(Value::Int64(2)));
        for selection in [None, Some(vec![0, 1]), Some(vec![0])] {
            let all = run(param(selection.clone(), None), rows());
            let some = run(param(selection, Some(filter.clone())), rows());
            let mut cursor = all.iter();
            for row in &some {
                assert!(cursor.any(|r| r == row), "{row:?} out of order or missing");
            }
            assert!(some.len() <= all.len());
        }
    }

    fn scan_schema() -> TupleSchema {
        TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("v", DataType::Int64),
        ])
    }

    /// One unbounded region of table 1 holding ids `0..n`.
    fn scan_fixture(n: i64) -> (Arc<MemoryStoreService>, Arc<RegionRouter>, EngineConfig) {
        let codec = TableCodec::new(TableId(1), scan_schema()).expect("codec");
        let region = RegionDescriptor {
            id: PartitionId(1),
            table: TableId(1),
            start_key: Vec::new(),
            end_key: Vec::new(),
            leader: Location::new("n1", 1),
            peers: vec![Location::new("n1", 1)],
            epoch: RegionEpoch::new(1, 1),
        };
        let svc = Arc::new(MemoryStoreService::new());
        let store = svc.add_region(region.clone()).expect("add");
        let pairs = (0..n)
            .map(|i| {
                let row = vec![Value::Int64(i), Value::Int64(i * 10)];
                KeyValue {
                    key: codec.encode_key(&row).expect("key"),
                    value: codec.encode_row(&row).expect("row"),
                }
            })
            .collect();
        store.put(&region.context(), pairs).expect("put");

        let config = EngineConfig {
            scan_page_rows: 3,
            retry_backoff_base_ms: 0,
            ..EngineConfig::default()
        };
        let router = Arc::new(RegionRouter::new(
            Arc::new(PartitionDirectory::from_regions([region])),
            svc.clone(),
            svc.clone(),
            &config,
        ));
        (svc, router, config)
    }

    fn run_scan(
        router: Arc<RegionRouter>,
        config: EngineConfig,
        selection: Option<TupleMapping>,
        filter: Option<Expr>,
    ) -> Vec<Vec<Value>> {
        let codec = TableCodec::new(TableId(1), scan_schema()).expect("codec");
        let ctx = Arc::new(
            TaskContext::new(JobId { domain: 1, seq: 1 }, Location::new("n1", 1), config)
                .with_router(router),
        );
        let scan = TableScanParam {
            partition: PartitionId(1),
            table: TableId(1),
            schema: scan_schema(),
            range: codec.range(),
        };
        let p = FilterProjectParam {
            source: SourceParam::TableScan(scan.clone()),
            source_arity: 2,
            selection,
            filter,
        };
        let mut job = Job::new(JobId { domain: 1, seq: 1 });
        let id = job.add_vertex(Location::new("n1", 1), OperatorParams::FilterProject(p.clone()));
        let vertex = Arc::new(job.vertex(id).expect("vertex").clone());
        let source = TableScanSource::new(scan).expect("source");
        let op = Arc::new(FilterProjectOperator::new(source, &p).expect("op"));
        let seed: TupleIter = Box::new(std::iter::once(Ok(Vec::new())));
        op.execute(ctx, vertex, seed)
            .expect("execute")
            .collect::<dtx_common::Result<Vec<_>>>()
            .expect("rows")
    }

    #[test]
    fn table_scan_pages_through_a_partition() {
        let (_svc, router, config) = scan_fixture(7);
        let out = run_scan(
            router,
            config,
            Some(TupleMapping::new(vec![1], 2).expect("mapping")),
            Some(Expr::col(0).binary(BinaryOp::Lt, Expr::lit(Value::Int64(50)))),
        );
        assert_eq!(
            out,
            (0..5).map(|i| vec![Value::Int64(i * 10)]).collect::<Vec<_>>()
        );
    }

    #[test]
    fn table_scan_reads_rows_moved_by_a_split() {
        let (svc, router, config) = scan_fixture(10);
        let codec = TableCodec::new(TableId(1), scan_schema()).expect("codec");
        let at = codec
            .encode_primary_key(&[Value::Int64(5)])
            .expect("split key");
        svc.split_region(PartitionId(1), &at, PartitionId(2))
            .expect("split");
        let out = run_scan(router, config, None, None);
        assert_eq!(
            out,
            (0..10)
                .map(|i| vec![Value::Int64(i), Value::Int64(i * 10)])
                .collect::<Vec<_>>()
        );
    }
}
