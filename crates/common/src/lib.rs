//! Shared configuration, error types, IDs, tuple model and observability primitives for dtx crates.
//!
//! Architecture role:
//! - defines engine/runtime configuration passed across layers
//! - provides common [`DtxError`] / [`Result`] contracts, including remote store error codes
//! - defines the row model ([`Value`], [`Tuple`], [`TupleSchema`], [`TupleMapping`])
//! - hosts metrics
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`mapping`]
//! - [`metrics`]
//! - [`schema`]
//! - [`value`]

pub mod config;
pub mod error;
pub mod ids;
pub mod mapping;
pub mod metrics;
pub mod schema;
pub mod value;

pub use config::EngineConfig;
pub use error::{DtxError, Result, StoreError, StoreErrorCode};
pub use ids::*;
pub use mapping::TupleMapping;
pub use metrics::{MetricsRegistry, global_metrics};
pub use schema::{ColumnDef, TupleSchema};
pub use value::{DataType, Tuple, Value};
