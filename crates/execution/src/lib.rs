#![warn(missing_docs)]

//! Job model and runtime for distributed transaction and query execution.
//!
//! Architecture role:
//! - vertex/output/job DAG and its serializable operator parameters
//! - pull-based operators bound to vertices
//! - a local executor wiring vertices through bounded channels
//!
//! Key modules:
//! - [`dag`]
//! - [`params`]
//! - [`operator`]
//! - [`executor`]

pub mod context;
pub mod dag;
pub mod executor;
pub mod expressions;
pub mod operator;
pub mod params;
pub mod profile;

// Re-export only what you want at the crate root (no globs).
pub use context::{CancelToken, SharedTaskContext, TaskContext, Tools};
pub use dag::{Job, JobIdGenerator, Output, OutputHint, OutputId, Vertex};
pub use executor::{JobResult, execute_job};
pub use expressions::{BinaryOp, Expr, PhysicalExpr, compile_expr};
pub use operator::{Operator, Route, TupleIter, create_operator};
pub use params::{
    CommitParam, DistanceCache, FilterProjectParam, HashParam, HashStrategy, OperatorParams,
    PreWriteParam, RollbackParam, RootParam, ScanCacheParam, SourceParam, StreamConverterParam,
    TableScanParam, TopKParam, VectorPointDistanceParam, VertexKind,
};
pub use profile::OperatorProfile;
