//! Embedded entry point for dtx.
//!
//! Architecture role:
//! - [`Engine`] runs a whole cluster in one process: catalog, in-memory stores, region
//!   routing and the transaction coordinator
//! - [`ingest`] turns delimited or JSON-lines files into batched transactional inserts
//!
//! Key modules:
//! - [`engine`]
//! - [`ingest`]

pub mod engine;
pub mod ingest;

pub use engine::{Engine, TableSink};
pub use ingest::{
    BatchFailure, DelimitedParser, IngestReport, Ingestor, InsertSink, JsonLinesParser,
    RecordParser, RowDiagnostic,
};
