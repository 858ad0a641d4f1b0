//! Per-vertex operator parameters.
//!
//! [`OperatorParams`] is a closed union over operator kinds; every variant is plain serde data
//! so a rendered job can be shipped to the nodes that run it.

use std::fmt;

use dtx_common::{IndexId, PartitionId, Result, TableId, Tuple, TupleMapping, TupleSchema};
use dtx_storage::{AlgorithmType, KeyRange, MetricType, Mutation, RegionDescriptor};
use serde::{Deserialize, Serialize};

use crate::expressions::Expr;

/// Operator kind tag of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexKind {
    /// Replays buffered transaction rows of one partition.
    ScanCache,
    /// Locks and stages keys of one partition.
    PreWrite,
    /// Makes staged keys of one partition visible.
    Commit,
    /// Releases locks and compensates writes of one partition.
    Rollback,
    /// Moves a partition's result stream to the coordinator.
    StreamConverter,
    /// Transaction coordinator gathering every participant.
    Root,
    /// Scan/upstream source with selection and filter.
    FilterProject,
    /// Key-hash fan-out.
    Hash,
    /// Vector distance scan over one region.
    VectorPointDistance,
    /// Top-k merge of distance-scored rows.
    TopK,
}

impl fmt::Display for VertexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Parameters of a [`VertexKind::ScanCache`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCacheParam {
    /// Partition whose buffered rows are replayed.
    pub partition: PartitionId,
    /// Buffered mutations in key order.
    pub rows: Vec<Mutation>,
}

/// Parameters of a [`VertexKind::PreWrite`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreWriteParam {
    /// Target partition.
    pub partition: PartitionId,
    /// Transaction start timestamp.
    pub start_ts: u64,
    /// Primary key of the transaction.
    pub primary_key: Vec<u8>,
    /// Lock TTL attached to each key.
    pub lock_ttl_ms: u64,
}

/// Parameters of a [`VertexKind::Commit`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitParam {
    /// Target partition.
    pub partition: PartitionId,
    /// Transaction start timestamp.
    pub start_ts: u64,
    /// Commit timestamp handed out by the oracle.
    pub commit_ts: u64,
}

/// Parameters of a [`VertexKind::Rollback`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackParam {
    /// Target partition.
    pub partition: PartitionId,
    /// Transaction start timestamp.
    pub start_ts: u64,
}

/// Parameters of a [`VertexKind::StreamConverter`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConverterParam {
    /// Partition whose stream is being moved.
    pub partition: PartitionId,
}

/// Parameters of a [`VertexKind::Root`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootParam {
    /// Number of participant acknowledgements the root must see.
    pub participants: usize,
}

/// Table scan over one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableScanParam {
    /// Partition to read.
    pub partition: PartitionId,
    /// Scanned table.
    pub table: TableId,
    /// Row schema of the table.
    pub schema: TupleSchema,
    /// Raw key range; clamped to the partition.
    pub range: KeyRange,
}

/// Where a filter/project vertex gets its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceParam {
    /// Tuples pulled from upstream vertices.
    Upstream,
    /// Rows paged from a store partition.
    TableScan(TableScanParam),
}

/// Parameters of a [`VertexKind::FilterProject`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterProjectParam {
    /// Row source.
    pub source: SourceParam,
    /// Arity of tuples produced by the source.
    pub source_arity: usize,
    /// Applied before the filter when set.
    pub selection: Option<TupleMapping>,
    /// Compiled against the selected tuple.
    pub filter: Option<Expr>,
}

/// Output-selection strategy of a hash fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashStrategy {
    /// `hash(key) % buckets`.
    Modulo {
        /// Number of outputs.
        buckets: usize,
    },
    /// Output `i` owns encoded keys in `[splits[i-1], splits[i])`.
    Range {
        /// Ascending encoded split keys; `n` splits give `n + 1` outputs.
        splits: Vec<Vec<u8>>,
    },
}

impl HashStrategy {
    /// Number of outputs this strategy selects among.
    pub fn outputs(&self) -> usize {
        match self {
            HashStrategy::Modulo { buckets } => *buckets,
            HashStrategy::Range { splits } => splits.len() + 1,
        }
    }
}

/// Parameters of a [`VertexKind::Hash`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashParam {
    /// Extracts the partitioning key.
    pub key_mapping: TupleMapping,
    /// Output selection.
    pub strategy: HashStrategy,
}

/// Candidate rows collected by one vector-distance probe.
///
/// Mutable scratch owned by a single executing vertex. It must be empty when a probe starts;
/// [`VectorPointDistanceParam::begin_probe`] guarantees that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceCache {
    rows: Vec<(Tuple, f32)>,
}

impl DistanceCache {
    /// Adds a scored row.
    pub fn push(&mut self, row: Tuple, distance: f32) {
        self.rows.push((row, distance));
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Forgets every cached row, keeping the allocation.
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Takes the `top_n` closest rows, leaving the cache empty.
    pub fn drain_top(&mut self, top_n: usize) -> Vec<(Tuple, f32)> {
        let mut rows = std::mem::take(&mut self.rows);
        rows.sort_by(|a, b| a.1.total_cmp(&b.1));
        rows.truncate(top_n);
        rows
    }
}

/// Parameters of a [`VertexKind::VectorPointDistance`] vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPointDistanceParam {
    /// Region scanned by this vertex.
    pub region: RegionDescriptor,
    /// Vector index id.
    pub index_id: IndexId,
    /// Physical table holding the indexed vectors.
    pub index_table_id: TableId,
    /// Row schema of the index table.
    pub schema: TupleSchema,
    /// Position of the vector column in the row.
    pub vector_column: usize,
    /// Query vector.
    pub target_vector: Vec<f32>,
    /// Expected dimension of `target_vector` and of stored vectors.
    pub dimension: usize,
    /// Index algorithm identifier.
    pub algorithm: AlgorithmType,
    /// Distance metric.
    pub metric: MetricType,
    /// Rows kept by this region.
    pub top_n: usize,
    #[serde(skip)]
    cache: DistanceCache,
}

impl PartialEq for VectorPointDistanceParam {
    fn eq(&self, other: &Self) -> bool {
        self.region == other.region
            && self.index_id == other.index_id
            && self.index_table_id == other.index_table_id
            && self.vector_column == other.vector_column
            && self.target_vector == other.target_vector
            && self.dimension == other.dimension
            && self.algorithm == other.algorithm
            && self.metric == other.metric
            && self.top_n == other.top_n
    }
}

impl VectorPointDistanceParam {
    /// Checks the query dimension and starts with an empty cache.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: RegionDescriptor,
        index_id: IndexId,
        index_table_id: TableId,
        schema: TupleSchema,
        vector_column: usize,
        target_vector: Vec<f32>,
        algorithm: AlgorithmType,
        metric: MetricType,
        top_n: usize,
    ) -> Result<Self> {
        let dimension = match schema.columns.get(vector_column).map(|c| c.data_type) {
            Some(dtx_common::DataType::VectorF32(dim)) => dim,
            _ => {
                return Err(dtx_common::DtxError::Planning(format!(
                    "column #{vector_column} of {index_table_id} is not a vector column"
                )));
            }
        };
        if target_vector.len() != dimension {
            return Err(dtx_common::DtxError::Planning(format!(
                "query vector has dimension {}, index {index_id} expects {dimension}",
                target_vector.len()
            )));
        }
        Ok(Self {
            region,
            index_id,
            index_table_id,
            schema,
            vector_column,
            target_vector,
            dimension,
            algorithm,
            metric,
            top_n,
            cache: DistanceCache::default(),
        })
    }

    /// Raw access to the scratch cache. Callers must clear it between probes.
    pub fn cache_mut(&mut self) -> &mut DistanceCache {
        &mut self.cache
    }

    /// Starts a probe on a freshly cleared cache.
    pub fn begin_probe(&mut self) -> &mut DistanceCache {
        self.cache.clear();
        &mut self.cache
    }
}

/// Parameters of a [`VertexKind::TopK`] vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKParam {
    /// Rows kept overall.
    pub k: usize,
    /// Column holding the distance (smaller first).
    pub distance_column: usize,
}

/// Closed union of operator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorParams {
    /// See [`ScanCacheParam`].
    ScanCache(ScanCacheParam),
    /// See [`PreWriteParam`].
    PreWrite(PreWriteParam),
    /// See [`CommitParam`].
    Commit(CommitParam),
    /// See [`RollbackParam`].
    Rollback(RollbackParam),
    /// See [`StreamConverterParam`].
    StreamConverter(StreamConverterParam),
    /// See [`RootParam`].
    Root(RootParam),
    /// See [`FilterProjectParam`].
    FilterProject(FilterProjectParam),
    /// See [`HashParam`].
    Hash(HashParam),
    /// See [`VectorPointDistanceParam`].
    VectorPointDistance(VectorPointDistanceParam),
    /// See [`TopKParam`].
    TopK(TopKParam),
}

impl OperatorParams {
    /// Kind tag of these parameters.
    pub fn kind(&self) -> VertexKind {
        match self {
            OperatorParams::ScanCache(_) => VertexKind::ScanCache,
            OperatorParams::PreWrite(_) => VertexKind::PreWrite,
            OperatorParams::Commit(_) => VertexKind::Commit,
            OperatorParams::Rollback(_) => VertexKind::Rollback,
            OperatorParams::StreamConverter(_) => VertexKind::StreamConverter,
            OperatorParams::Root(_) => VertexKind::Root,
            OperatorParams::FilterProject(_) => VertexKind::FilterProject,
            OperatorParams::Hash(_) => VertexKind::Hash,
            OperatorParams::VectorPointDistance(_) => VertexKind::VectorPointDistance,
            OperatorParams::TopK(_) => VertexKind::TopK,
        }
    }

    /// Partition a per-partition vertex is bound to.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            OperatorParams::ScanCache(p) => Some(p.partition),
            OperatorParams::PreWrite(p) => Some(p.partition),
            OperatorParams::Commit(p) => Some(p.partition),
            OperatorParams::Rollback(p) => Some(p.partition),
            OperatorParams::StreamConverter(p) => Some(p.partition),
            OperatorParams::FilterProject(FilterProjectParam {
                source: SourceParam::TableScan(scan),
                ..
            }) => Some(scan.partition),
            OperatorParams::VectorPointDistance(p) => Some(p.region.id),
            OperatorParams::Root(_)
            | OperatorParams::FilterProject(_)
            | OperatorParams::Hash(_)
            | OperatorParams::TopK(_) => None,
        }
    }
}
