//! Streaming operators bound to job vertices.
//!
//! Operators are pull-based: the executor hands each one the merged upstream iterator of its
//! vertex and drains the iterator it returns. Vertices without inputs receive a single empty
//! seed tuple, so source operators expand "one trigger" into their scan.

pub mod filter_project;
pub mod hash;
pub mod transaction;
pub mod vector;

use std::sync::Arc;

use dtx_common::{Result, Tuple, Value};

use crate::context::SharedTaskContext;
use crate::dag::Vertex;
use crate::params::{OperatorParams, SourceParam};

pub use filter_project::{FilterProjectOperator, TableScanSource, TupleSource, UpstreamSource};
pub use hash::HashOperator;
pub use transaction::{
    CommitOperator, PreWriteOperator, RollbackOperator, RootOperator, ScanCacheOperator,
    StreamConverterOperator,
};
pub use vector::{TopKOperator, VectorPointDistanceOperator};

/// Lazy, finite, single-pass tuple sequence.
pub type TupleIter = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

/// Where a produced tuple goes among a vertex's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Every output.
    All,
    /// Exactly one output.
    One(usize),
}

/// A unit of streaming computation bound to one vertex.
pub trait Operator: Send + Sync {
    /// Name used in logs, profiles and metrics.
    fn name(&self) -> &'static str;

    /// Turns the upstream sequence into this vertex's output sequence.
    fn execute(
        self: Arc<Self>,
        ctx: SharedTaskContext,
        vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter>;

    /// Output selection for one produced tuple.
    fn route(&self, _tuple: &[Value], _outputs: usize) -> Result<Route> {
        Ok(Route::All)
    }
}

/// Expands every upstream tuple through `f`, preserving upstream order.
pub fn flat_map_tuples<F>(upstream: TupleIter, mut f: F) -> TupleIter
where
    F: FnMut(Tuple) -> Result<TupleIter> + Send + 'static,
{
    Box::new(upstream.flat_map(move |item| -> TupleIter {
        match item.and_then(&mut f) {
            Ok(it) => it,
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }))
}

/// Builds the operator for a vertex's parameters.
pub fn create_operator(params: &OperatorParams) -> Result<Arc<dyn Operator>> {
    let op: Arc<dyn Operator> = match params {
        OperatorParams::ScanCache(p) => Arc::new(ScanCacheOperator::new(p.clone())),
        OperatorParams::PreWrite(p) => Arc::new(PreWriteOperator::new(p.clone())),
        OperatorParams::Commit(p) => Arc::new(CommitOperator::new(p.clone())),
        OperatorParams::Rollback(p) => Arc::new(RollbackOperator::new(p.clone())),
        OperatorParams::StreamConverter(p) => Arc::new(StreamConverterOperator::new(p.clone())),
        OperatorParams::Root(p) => Arc::new(RootOperator::new(p.clone())),
        OperatorParams::FilterProject(p) => match &p.source {
            SourceParam::Upstream => {
                Arc::new(FilterProjectOperator::new(UpstreamSource, p)?) as Arc<dyn Operator>
            }
            SourceParam::TableScan(scan) => Arc::new(FilterProjectOperator::new(
                TableScanSource::new(scan.clone())?,
                p,
            )?) as Arc<dyn Operator>,
        },
        OperatorParams::Hash(p) => Arc::new(HashOperator::new(p.clone())?),
        OperatorParams::VectorPointDistance(p) => {
            Arc::new(VectorPointDistanceOperator::new(p.clone()))
        }
        OperatorParams::TopK(p) => Arc::new(TopKOperator::new(p.clone())),
    };
    Ok(op)
}
