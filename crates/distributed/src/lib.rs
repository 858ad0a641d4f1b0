//! Distributed transaction execution.
//!
//! Architecture role:
//! - transaction state and per-phase channel maps
//! - element templates rendered into phase jobs
//! - the coordinator driving pre-write, commit and compensating rollback
//! - scatter/gather rendering for vector-distance search
//!
//! Key modules:
//! - [`render`]
//! - [`coordinator`]
//! - [`scatter`]

pub mod coordinator;
pub mod element;
pub mod render;
pub mod scatter;
pub mod timestamp;
pub mod transaction;
mod visit;

pub use coordinator::TransactionCoordinator;
pub use element::{
    Element, ElementName, MutationLeaf, RootLeaf, ScanCacheLeaf, StreamConverterLeaf,
};
pub use render::{RenderVisitor, render, render_element};
pub use scatter::render_vector_search;
pub use timestamp::{LocalTimestampOracle, TimestampOracle};
pub use transaction::{Channel, Phase, Transaction, TxnState};
