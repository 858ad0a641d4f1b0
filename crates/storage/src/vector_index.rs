use std::fmt;

use dtx_common::{DtxError, Result};
use serde::{Deserialize, Serialize};

/// Distance metric of a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    L2,
    InnerProduct,
    Cosine,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::L2 => f.write_str("L2"),
            MetricType::InnerProduct => f.write_str("INNER_PRODUCT"),
            MetricType::Cosine => f.write_str("COSINE"),
        }
    }
}

/// Index algorithm identifier carried in scan parameters.
///
/// Only exact (flat) search is executed locally; other identifiers are forwarded so a store
/// with a native index can pick them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmType {
    Flat,
    Hnsw,
}

/// One scored candidate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorCandidate {
    pub key: Vec<u8>,
    /// Smaller is closer for every metric.
    pub distance: f32,
}

/// Distance computation service shared by all vector-distance operators of a node.
pub trait DistanceTool: Send + Sync {
    fn name(&self) -> &str;

    /// Distance between `query` and `candidate`; smaller is closer.
    fn distance(&self, metric: MetricType, query: &[f32], candidate: &[f32]) -> Result<f32>;
}

/// Exact distance over plain `f32` slices.
#[derive(Debug, Default, Clone, Copy)]
pub struct BruteForceDistanceTool;

impl DistanceTool for BruteForceDistanceTool {
    fn name(&self) -> &str {
        "brute_force"
    }

    fn distance(&self, metric: MetricType, query: &[f32], candidate: &[f32]) -> Result<f32> {
        if query.len() != candidate.len() {
            return Err(DtxError::Execution(format!(
                "vector dimension mismatch: query {} vs candidate {}",
                query.len(),
                candidate.len()
            )));
        }
        let dot = || query.iter().zip(candidate).map(|(a, b)| a * b).sum::<f32>();
        Ok(match metric {
            MetricType::L2 => query
                .iter()
                .zip(candidate)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>(),
            MetricType::InnerProduct => -dot(),
            MetricType::Cosine => {
                let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
                let denom = norm(query) * norm(candidate);
                if denom == 0.0 { 1.0 } else { 1.0 - dot() / denom }
            }
        })
    }
}
