//! Typed scalar values and the row type flowing between operators.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One row. Arity and column order are fixed by the producing schema at plan time.
///
/// Operators hand tuples downstream by value and never mutate a tuple after emitting it.
pub type Tuple = Vec<Value>;

/// Column data types understood by the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Bytes,
    /// Fixed-dimension float vector.
    VectorF32(usize),
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => f.write_str("BOOLEAN"),
            DataType::Int64 => f.write_str("BIGINT"),
            DataType::Float64 => f.write_str("DOUBLE"),
            DataType::Utf8 => f.write_str("VARCHAR"),
            DataType::Bytes => f.write_str("BINARY"),
            DataType::VectorF32(dim) => write!(f, "FLOAT_VECTOR({dim})"),
        }
    }
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    VectorF32(Vec<f32>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Data type of a non-null value.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Bytes(_) => Some(DataType::Bytes),
            Value::VectorF32(v) => Some(DataType::VectorF32(v.len())),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::VectorF32(v) => Some(v),
            _ => None,
        }
    }

    /// SQL-style comparison. `None` when either side is null or the types are incomparable.
    ///
    /// Integers and doubles compare numerically with each other.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0_u8.hash(state),
            Self::Boolean(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Int64(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Float64(v) => {
                3_u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Utf8(v) => {
                4_u8.hash(state);
                v.hash(state);
            }
            Self::Bytes(v) => {
                5_u8.hash(state);
                v.hash(state);
            }
            Self::VectorF32(v) => {
                6_u8.hash(state);
                v.len().hash(state);
                for x in v {
                    x.to_bits().hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "x'{}'", hex(v)),
            Value::VectorF32(v) => write!(f, "{v:?}"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::Value;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn numeric_values_compare_across_int_and_double() {
        assert_eq!(
            Value::Int64(2).compare(&Value::Float64(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int64(1)), None);
        assert_eq!(Value::Utf8("a".into()).compare(&Value::Int64(1)), None);
    }

    #[test]
    fn equal_values_hash_equally() {
        assert_eq!(
            hash_of(&Value::Float64(1.5)),
            hash_of(&Value::Float64(1.5))
        );
        assert_ne!(hash_of(&Value::Int64(1)), hash_of(&Value::Boolean(true)));
    }
}
