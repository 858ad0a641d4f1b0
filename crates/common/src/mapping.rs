use serde::{Deserialize, Serialize};

use crate::error::{DtxError, Result};
use crate::value::Value;

/// Ordered selection of source-column indices.
///
/// Projection is pure: it clones the selected cells into a new tuple and never touches
/// the source. Construct through [`TupleMapping::new`] so every index is checked against
/// the source arity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleMapping {
    indices: Vec<usize>,
    source_arity: usize,
}

impl TupleMapping {
    pub fn new(indices: Vec<usize>, source_arity: usize) -> Result<Self> {
        if let Some(bad) = indices.iter().find(|i| **i >= source_arity) {
            return Err(DtxError::Planning(format!(
                "mapping index {bad} out of range for arity {source_arity}"
            )));
        }
        Ok(Self {
            indices,
            source_arity,
        })
    }

    /// Identity mapping over `arity` columns.
    pub fn identity(arity: usize) -> Self {
        Self {
            indices: (0..arity).collect(),
            source_arity: arity,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn source_arity(&self) -> usize {
        self.source_arity
    }

    /// Projects `tuple` through the mapping.
    ///
    /// Fails only when the tuple is narrower than the arity the mapping was validated for.
    pub fn project(&self, tuple: &[Value]) -> Result<Vec<Value>> {
        if tuple.len() < self.source_arity {
            return Err(DtxError::Execution(format!(
                "tuple arity {} is smaller than mapping source arity {}",
                tuple.len(),
                self.source_arity
            )));
        }
        Ok(self.indices.iter().map(|i| tuple[*i].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::TupleMapping;
    use crate::value::Value;

    #[test]
    fn projects_and_reorders() {
        let m = TupleMapping::new(vec![2, 0], 3).expect("mapping");
        let out = m
            .project(&[Value::Int64(1), Value::Int64(2), Value::Int64(3)])
            .expect("project");
        assert_eq!(out, vec![Value::Int64(3), Value::Int64(1)]);
    }

    #[test]
    fn rejects_out_of_range_index() {
        assert!(TupleMapping::new(vec![0, 3], 3).is_err());
    }

    #[test]
    fn rejects_narrow_tuple() {
        let m = TupleMapping::new(vec![1], 2).expect("mapping");
        assert!(m.project(&[Value::Int64(1)]).is_err());
    }
}
