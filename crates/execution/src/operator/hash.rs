//! Key-partitioned fan-out.
//!
//! Bucketing runs over the store encoding of the key columns with a fixed FNV-1a hash, so
//! every node and every build sends a key to the same output.

use std::sync::Arc;

use dtx_common::{DtxError, Result, Value};
use dtx_storage::codec::encode_key_value;

use super::{Operator, Route, TupleIter};
use crate::context::SharedTaskContext;
use crate::dag::Vertex;
use crate::params::{HashParam, HashStrategy};

/// Single-destination fan-out keyed by a projected key.
///
/// The key columns are encoded with the store key codec before bucketing, so equal keys
/// always pick the same output and range strategies agree with store key order.
#[derive(Debug, Clone)]
pub struct HashOperator {
    param: HashParam,
}

impl HashOperator {
    /// Rejects strategies that select among zero outputs.
    pub fn new(param: HashParam) -> Result<Self> {
        if param.strategy.outputs() == 0 {
            return Err(DtxError::Planning(
                "hash strategy must have at least one output".to_string(),
            ));
        }
        if let HashStrategy::Range { splits } = &param.strategy {
            if splits.windows(2).any(|w| w[0] >= w[1]) {
                return Err(DtxError::Planning(
                    "range strategy splits must be strictly ascending".to_string(),
                ));
            }
        }
        Ok(Self { param })
    }

    /// Output index for `tuple`.
    pub fn select_output(&self, tuple: &[Value]) -> Result<usize> {
        let key = self.param.key_mapping.project(tuple)?;
        let mut encoded = Vec::new();
        for v in &key {
            encode_key_value(&mut encoded, v)?;
        }
        Ok(match &self.param.strategy {
            HashStrategy::Modulo { buckets } => (fnv1a(&encoded) % *buckets as u64) as usize,
            HashStrategy::Range { splits } => {
                splits.partition_point(|s| s.as_slice() <= encoded.as_slice())
            }
        })
    }
}

/// FNV-1a 64 over raw bytes.
fn fnv1a(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Operator for HashOperator {
    fn name(&self) -> &'static str {
        "Hash"
    }

    fn execute(
        self: Arc<Self>,
        _ctx: SharedTaskContext,
        _vertex: Arc<Vertex>,
        upstream: TupleIter,
    ) -> Result<TupleIter> {
        Ok(upstream)
    }

    fn route(&self, tuple: &[Value], outputs: usize) -> Result<Route> {
        let index = self.select_output(tuple)?;
        if index >= outputs {
            return Err(DtxError::MalformedPlan(format!(
                "hash selected output {index} but the vertex has {outputs}"
            )));
        }
        Ok(Route::One(index))
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{TupleMapping, Value};
    use dtx_storage::codec::encode_key_value;

    use super::{HashOperator, fnv1a};
    use crate::params::{HashParam, HashStrategy};

    fn modulo(buckets: usize) -> HashOperator {
        HashOperator::new(HashParam {
            key_mapping: TupleMapping::new(vec![1], 3).expect("mapping"),
            strategy: HashStrategy::Modulo { buckets },
        })
        .expect("op")
    }

    #[test]
    fn equal_keys_route_identically() {
        let op = modulo(4);
        for i in 0..50 {
            let a = vec![Value::Int64(i), Value::Utf8(format!("k{}", i % 7)), Value::Null];
            let b = vec![Value::Int64(-i), Value::Utf8(format!("k{}", i % 7)), Value::Boolean(true)];
            let first = op.select_output(&a).expect("a");
            assert!(first < 4);
            assert_eq!(first, op.select_output(&b).expect("b"));
            assert_eq!(first, op.select_output(&a).expect("again"));
        }
        // a second instance with the same strategy agrees
        let other = modulo(4);
        let t = vec![Value::Int64(0), Value::Utf8("x".into()), Value::Null];
        assert_eq!(op.select_output(&t).expect("t"), other.select_output(&t).expect("t"));
    }

    #[test]
    fn signed_zero_floats_route_together() {
        for buckets in 2..40 {
            let op = modulo(buckets);
            let pos = vec![Value::Null, Value::Float64(0.0), Value::Null];
            let neg = vec![Value::Null, Value::Float64(-0.0), Value::Null];
            assert_eq!(
                op.select_output(&pos).expect("pos"),
                op.select_output(&neg).expect("neg"),
                "buckets = {buckets}"
            );
        }
    }

    #[test]
    fn bucket_hash_is_fixed() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn range_strategy_follows_key_order() {
        let mut split = Vec::new();
        encode_key_value(&mut split, &Value::Int64(100)).expect("split");
        let op = HashOperator::new(HashParam {
            key_mapping: TupleMapping::new(vec![0], 1).expect("mapping"),
            strategy: HashStrategy::Range { splits: vec![split] },
        })
        .expect("op");
        assert_eq!(op.select_output(&[Value::Int64(-5)]).expect("low"), 0);
        assert_eq!(op.select_output(&[Value::Int64(100)]).expect("edge"), 1);
        assert_eq!(op.select_output(&[Value::Int64(7000)]).expect("high"), 1);
    }

    #[test]
    fn zero_buckets_are_rejected() {
        assert!(
            HashOperator::new(HashParam {
                key_mapping: TupleMapping::identity(1),
                strategy: HashStrategy::Modulo { buckets: 0 },
            })
            .is_err()
        );
    }
}
