use std::sync::Arc;

use dtx_common::{DtxError, EngineConfig, Location, Result, Tuple, TupleMapping, Value, global_metrics};
use dtx_distributed::{
    LocalTimestampOracle, TimestampOracle, Transaction, TransactionCoordinator,
    render_vector_search,
};
use dtx_execution::{
    Expr, FilterProjectParam, Job, JobIdGenerator, OperatorParams, SourceParam, TableScanParam,
    TaskContext, Tools, execute_job,
};
use dtx_storage::{
    Catalog, MemoryStoreService, Mutation, MutationOp, PartitionDirectory, RegionRouter, TableDef,
};
use tracing::info;

use crate::ingest::InsertSink;

/// Embedded cluster: every region lives in an in-memory store on this process, while jobs
/// are still rendered with the placement a multi-node deployment would use.
pub struct Engine {
    catalog: Catalog,
    cluster: Arc<MemoryStoreService>,
    router: Arc<RegionRouter>,
    coordinator: TransactionCoordinator,
    config: EngineConfig,
    location: Location,
    tools: Tools,
    job_ids: JobIdGenerator,
}

impl Engine {
    /// Lays out every catalog table over `nodes`; the first node coordinates.
    pub fn new(catalog: Catalog, nodes: Vec<Location>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let location = nodes
            .first()
            .cloned()
            .ok_or_else(|| DtxError::InvalidConfig("at least one node is required".to_string()))?;
        let regions = catalog.initial_regions(&nodes)?;
        let cluster = Arc::new(MemoryStoreService::new());
        for region in &regions {
            cluster.add_region(region.clone())?;
        }
        let router = Arc::new(RegionRouter::new(
            Arc::new(PartitionDirectory::from_regions(regions.clone())),
            cluster.clone(),
            cluster.clone(),
            &config,
        ));
        let tso: Arc<dyn TimestampOracle> = Arc::new(LocalTimestampOracle::new());
        let tools = Tools::default();
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&router),
            tso,
            config.clone(),
            location.clone(),
        )
        .with_tools(tools.clone());
        info!(
            tables = catalog.tables().len(),
            regions = regions.len(),
            nodes = nodes.len(),
            "engine started"
        );
        Ok(Self {
            catalog,
            cluster,
            router,
            coordinator,
            job_ids: JobIdGenerator::new(config.node_domain),
            config,
            location,
            tools,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cluster(&self) -> &Arc<MemoryStoreService> {
        &self.cluster
    }

    pub fn router(&self) -> &Arc<RegionRouter> {
        &self.router
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn begin(&self) -> Result<Transaction> {
        self.coordinator.begin()
    }

    /// Buffers an insert-or-replace of `row` in `txn`.
    pub fn insert(&self, txn: &mut Transaction, table: &str, row: &[Value]) -> Result<()> {
        let def = self.catalog.get(table)?;
        let codec = def.codec()?;
        def.schema.check(row)?;
        let key = codec.encode_key(row)?;
        let partition = self.router.directory().locate(def.id, &key)?.id;
        txn.buffer(
            partition,
            Mutation {
                op: MutationOp::Put,
                key,
                value: Some(codec.encode_row(row)?),
            },
        )
    }

    /// Buffers a delete of the row with primary key `key`.
    pub fn delete(&self, txn: &mut Transaction, table: &str, key: &[Value]) -> Result<()> {
        let def = self.catalog.get(table)?;
        let key = def.codec()?.encode_primary_key(key)?;
        let partition = self.router.directory().locate(def.id, &key)?.id;
        txn.buffer(
            partition,
            Mutation {
                op: MutationOp::Delete,
                key,
                value: None,
            },
        )
    }

    pub async fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.coordinator.commit(txn).await
    }

    pub async fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        self.coordinator.rollback(txn).await
    }

    /// Inserts `rows` in one transaction. Returns the number of distinct keys written; a
    /// later row with the same primary key replaces an earlier one.
    pub async fn insert_rows(&self, table: &str, rows: &[Tuple]) -> Result<usize> {
        let mut txn = self.begin()?;
        for row in rows {
            self.insert(&mut txn, table, row)?;
        }
        let written = txn.len();
        self.commit(&mut txn).await?;
        Ok(written)
    }

    /// Point read by primary key. Runs on the blocking pool, since routing retries back off
    /// by sleeping.
    pub async fn get(&self, table: &str, key: &[Value]) -> Result<Option<Tuple>> {
        let def = self.catalog.get(table)?;
        let codec = def.codec()?;
        let key = codec.encode_primary_key(key)?;
        let router = Arc::clone(&self.router);
        let table_id = def.id;
        let raw = tokio::task::spawn_blocking(move || {
            router.call_key(table_id, &key, |store, region| store.get(region, &key))
        })
        .await
        .map_err(|e| DtxError::Execution(format!("point read task failed: {e}")))??;
        raw.map(|bytes| codec.decode_row(&bytes)).transpose()
    }

    /// Full scan in key order, with an optional selection applied before an optional filter.
    pub async fn scan(
        &self,
        table: &str,
        selection: Option<Vec<usize>>,
        filter: Option<Expr>,
    ) -> Result<Vec<Tuple>> {
        let def = self.catalog.get(table)?;
        let arity = def.schema.arity();
        let selection = selection
            .map(|indices| TupleMapping::new(indices, arity))
            .transpose()?;
        let range = def.codec()?.range();
        let mut job = Job::new(self.job_ids.next_id());
        for region in self.router.directory().table_regions(def.id) {
            let Some(range) = region.clamp(&range) else {
                continue;
            };
            job.add_vertex(
                region.leader.clone(),
                OperatorParams::FilterProject(FilterProjectParam {
                    source: SourceParam::TableScan(TableScanParam {
                        partition: region.id,
                        table: def.id,
                        schema: def.schema.clone(),
                        range,
                    }),
                    source_arity: arity,
                    selection: selection.clone(),
                    filter: filter.clone(),
                }),
            );
        }
        Ok(self.run(job).await?.rows)
    }

    /// Closest `top_n` rows to `query` by the table's vector index, each with its distance
    /// appended.
    pub async fn vector_search(&self, table: &str, query: &[f32], top_n: usize) -> Result<Vec<Tuple>> {
        let def = self.catalog.get(table)?;
        let regions = self.router.directory().table_regions(def.id);
        let mut job = Job::new(self.job_ids.next_id());
        render_vector_search(&mut job, def, &regions, query, top_n, &self.location)?;
        Ok(self.run(job).await?.rows)
    }

    pub fn prometheus_metrics(&self) -> String {
        global_metrics().render_prometheus()
    }

    /// Sink inserting ingested batches into `table`, one transaction per batch.
    pub fn sink<'a>(&'a self, table: &str) -> Result<TableSink<'a>> {
        let def = self.catalog.get(table)?;
        Ok(TableSink { engine: self, table: def })
    }

    async fn run(&self, job: Job) -> Result<dtx_execution::JobResult> {
        let ctx = TaskContext::new(job.id(), self.location.clone(), self.config.clone())
            .with_router(Arc::clone(&self.router))
            .with_tools(self.tools.clone());
        execute_job(Arc::new(job), Arc::new(ctx)).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("location", &self.location)
            .field("tables", &self.catalog.tables().len())
            .finish()
    }
}

/// [`InsertSink`] bound to one table of an [`Engine`].
#[derive(Debug)]
pub struct TableSink<'a> {
    engine: &'a Engine,
    table: &'a TableDef,
}

impl InsertSink for TableSink<'_> {
    async fn insert_batch(&self, rows: &[Tuple]) -> Result<usize> {
        self.engine.insert_rows(&self.table.name, rows).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use dtx_common::{
        ColumnDef, DataType, EngineConfig, Location, StoreErrorCode, TableId, TupleSchema, Value,
    };
    use dtx_execution::{BinaryOp, Expr};
    use dtx_storage::{Catalog, TableDef};

    use super::Engine;

    fn engine() -> Engine {
        engine_with(EngineConfig {
            retry_backoff_base_ms: 0,
            ..EngineConfig::default()
        })
    }

    fn engine_with(config: EngineConfig) -> Engine {
        let mut catalog = Catalog::new();
        catalog
            .register_table(TableDef {
                id: TableId(1),
                name: "users".to_string(),
                schema: TupleSchema::new(vec![
                    ColumnDef::key("id", DataType::Int64),
                    ColumnDef::new("name", DataType::Utf8),
                ]),
                split_keys: vec![vec![serde_json::json!(100)], vec![serde_json::json!(200)]],
                vector_index: None,
            })
            .expect("register");
        Engine::new(
            catalog,
            vec![Location::new("n1", 1), Location::new("n2", 1)],
            config,
        )
        .expect("engine")
    }

    fn user(id: i64) -> Vec<Value> {
        vec![Value::Int64(id), Value::Utf8(format!("u{id}"))]
    }

    #[tokio::test]
    async fn rows_spanning_regions_commit_atomically_and_scan_in_key_order() {
        let engine = engine();
        let rows = [250, 5, 150, 99].map(user).to_vec();
        engine.insert_rows("users", &rows).await.expect("insert");

        let all = engine.scan("users", None, None).await.expect("scan");
        let ids = all.iter().map(|r| r[0].clone()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            [5, 99, 150, 250].map(Value::Int64).to_vec()
        );

        let filtered = engine
            .scan(
                "users",
                Some(vec![1]),
                Some(Expr::col(0).binary(BinaryOp::Eq, Expr::lit(Value::Utf8("u150".into())))),
            )
            .await
            .expect("filtered scan");
        assert_eq!(filtered, vec![vec![Value::Utf8("u150".into())]]);
    }

    #[tokio::test]
    async fn deletes_and_point_reads() {
        let engine = engine();
        engine
            .insert_rows("users", &[user(1), user(101)])
            .await
            .expect("insert");
        assert_eq!(
            engine.get("users", &[Value::Int64(101)]).await.expect("get"),
            Some(user(101))
        );

        let mut txn = engine.begin().expect("begin");
        engine
            .delete(&mut txn, "users", &[Value::Int64(101)])
            .expect("delete");
        engine.commit(&mut txn).await.expect("commit");
        assert_eq!(engine.get("users", &[Value::Int64(101)]).await.expect("get"), None);
        assert_eq!(
            engine.get("users", &[Value::Int64(1)]).await.expect("get"),
            Some(user(1))
        );
    }

    #[tokio::test]
    async fn repeated_keys_count_once() {
        let engine = engine();
        let rows = vec![user(4), user(9), vec![Value::Int64(4), Value::Utf8("again".into())]];
        assert_eq!(engine.insert_rows("users", &rows).await.expect("insert"), 2);
        assert_eq!(
            engine.get("users", &[Value::Int64(4)]).await.expect("get"),
            Some(vec![Value::Int64(4), Value::Utf8("again".into())])
        );
        assert_eq!(engine.scan("users", None, None).await.expect("scan").len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn point_reads_leave_the_runtime_free_while_backing_off() {
        let engine = engine_with(EngineConfig {
            retry_backoff_base_ms: 20,
            ..EngineConfig::default()
        });
        engine.insert_rows("users", &[user(1)]).await.expect("insert");
        let first = engine.router().directory().table_regions(TableId(1))[0].id;
        let store = engine.cluster().store(first).expect("store");
        store.fail_next(StoreErrorCode::NotLeader).expect("inject");
        store.fail_next(StoreErrorCode::NotLeader).expect("inject");

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        let row = engine.get("users", &[Value::Int64(1)]).await.expect("get");
        ticker.abort();
        assert_eq!(row, Some(user(1)));
        // a blocking read would have held the only runtime thread for the whole backoff
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn explicit_rollback_discards_buffered_writes() {
        let engine = engine();
        let mut txn = engine.begin().expect("begin");
        engine.insert(&mut txn, "users", &user(7)).expect("insert");
        engine.rollback(&mut txn).await.expect("rollback");
        assert!(engine.scan("users", None, None).await.expect("scan").is_empty());
    }

    #[test]
    fn rows_must_fit_the_schema() {
        let engine = engine();
        let mut txn = engine.begin().expect("begin");
        assert!(engine
            .insert(&mut txn, "users", &[Value::Utf8("x".into()), Value::Null])
            .is_err());
        assert!(engine.insert(&mut txn, "missing", &user(1)).is_err());
    }
}
