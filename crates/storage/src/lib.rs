//! Partition routing and store access for dtx.
//!
//! Architecture role:
//! - region descriptors and the copy-on-refresh [`PartitionDirectory`]
//! - the [`StoreInstance`] / [`StoreService`] contracts operators read and write through
//! - the routing-error classifier and the retrying [`RegionRouter`]
//! - table key/row codec, catalog, and the distance tool used by vector scans
//!
//! [`memory`] provides an in-process implementation of every contract, used by the embedded
//! engine and by tests.

pub mod catalog;
pub mod codec;
pub mod directory;
pub mod errors;
pub mod memory;
pub mod region;
pub mod route;
pub mod router;
pub mod store;
pub mod vector_index;

pub use catalog::{Catalog, TableDef, VectorIndexDef};
pub use codec::TableCodec;
pub use directory::{DirectorySnapshot, PartitionDirectory};
pub use errors::{ErrorClass, classify, is_invalid_epoch, is_invalid_peer};
pub use memory::{MemoryStore, MemoryStoreService};
pub use region::{KeyRange, RegionContext, RegionDescriptor, RegionEpoch};
pub use route::RouteSource;
pub use router::{RegionRouter, ScanPage};
pub use store::{
    CommitRequest, KeyValue, Mutation, MutationOp, PrewriteRequest, RollbackRequest,
    StoreInstance, StoreService,
};
pub use vector_index::{
    AlgorithmType, BruteForceDistanceTool, DistanceTool, MetricType, VectorCandidate,
};
