//! Table key/row codec.
//!
//! Keys are `t` + table id (big endian) + `_r` + the primary-key columns in an
//! order-preserving encoding, so raw key order equals primary-key order within a table and
//! a table occupies one contiguous key range. Row values are JSON encoded tuples.

use dtx_common::{DtxError, Result, TableId, Tuple, TupleSchema, Value};

use crate::region::KeyRange;

const TABLE_PREFIX: u8 = b't';
const ROW_SEPARATOR: &[u8; 2] = b"_r";

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_UTF8: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

/// `t{id}_r`, the prefix shared by every row key of `table`.
pub fn table_prefix(table: TableId) -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.push(TABLE_PREFIX);
    out.extend_from_slice(&table.0.to_be_bytes());
    out.extend_from_slice(ROW_SEPARATOR);
    out
}

/// Whole key range of `table`.
pub fn table_range(table: TableId) -> KeyRange {
    let start = table_prefix(table);
    let mut end = start.clone();
    // `_r` + 1 never ends a row key, so this bounds the prefix.
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    KeyRange { start, end }
}

/// Appends one order-preserving key component.
pub fn encode_key_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Boolean(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int64(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::Float64(v) => {
            out.push(TAG_FLOAT);
            // Equal floats share one encoding: -0.0 folds into 0.0 and every NaN into one.
            let bits = if *v == 0.0 {
                0
            } else if v.is_nan() {
                f64::NAN.to_bits()
            } else {
                v.to_bits()
            };
            let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::Utf8(s) => {
            out.push(TAG_UTF8);
            escape_bytes(out, s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            escape_bytes(out, b);
        }
        Value::VectorF32(_) => {
            return Err(DtxError::Unsupported(
                "vector columns cannot be part of a key".to_string(),
            ));
        }
    }
    Ok(())
}

// 0x00 is escaped as 0x00 0xff and the component ends with 0x00 0x01.
fn escape_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for b in bytes {
        out.push(*b);
        if *b == 0 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

/// Per-table encoder binding a schema to its key layout.
#[derive(Debug, Clone)]
pub struct TableCodec {
    table: TableId,
    schema: TupleSchema,
    key_indices: Vec<usize>,
}

impl TableCodec {
    pub fn new(table: TableId, schema: TupleSchema) -> Result<Self> {
        let key_indices = schema.key_indices();
        if key_indices.is_empty() {
            return Err(DtxError::InvalidConfig(format!(
                "table {table} has no primary-key column"
            )));
        }
        Ok(Self {
            table,
            schema,
            key_indices,
        })
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    /// Store key of a full row.
    pub fn encode_key(&self, tuple: &[Value]) -> Result<Vec<u8>> {
        if tuple.len() != self.schema.arity() {
            return Err(DtxError::Execution(format!(
                "tuple arity {} does not match table {} arity {}",
                tuple.len(),
                self.table,
                self.schema.arity()
            )));
        }
        let key = self
            .key_indices
            .iter()
            .map(|i| tuple[*i].clone())
            .collect::<Vec<_>>();
        self.encode_primary_key(&key)
    }

    /// Store key from primary-key values only, in key-column order.
    pub fn encode_primary_key(&self, key: &[Value]) -> Result<Vec<u8>> {
        if key.len() != self.key_indices.len() {
            return Err(DtxError::Execution(format!(
                "table {} expects {} key values, got {}",
                self.table,
                self.key_indices.len(),
                key.len()
            )));
        }
        let mut out = table_prefix(self.table);
        for v in key {
            if v.is_null() {
                return Err(DtxError::Execution(format!(
                    "null primary-key value for table {}",
                    self.table
                )));
            }
            encode_key_value(&mut out, v)?;
        }
        Ok(out)
    }

    pub fn encode_row(&self, tuple: &[Value]) -> Result<Vec<u8>> {
        self.schema.check(tuple)?;
        serde_json::to_vec(tuple)
            .map_err(|e| DtxError::Execution(format!("row encoding failed: {e}")))
    }

    pub fn decode_row(&self, bytes: &[u8]) -> Result<Tuple> {
        let tuple: Tuple = serde_json::from_slice(bytes)
            .map_err(|e| DtxError::Execution(format!("row decoding failed: {e}")))?;
        self.schema.check(&tuple)?;
        Ok(tuple)
    }

    pub fn range(&self) -> KeyRange {
        table_range(self.table)
    }
}

#[cfg(test)]
mod tests {
    use dtx_common::{ColumnDef, DataType, TableId, TupleSchema, Value};

    use super::{TableCodec, encode_key_value, table_range};

    fn key(v: Value) -> Vec<u8> {
        let mut out = Vec::new();
        encode_key_value(&mut out, &v).expect("encode");
        out
    }

    #[test]
    fn integer_and_float_keys_sort_numerically() {
        assert!(key(Value::Int64(-5)) < key(Value::Int64(-1)));
        assert!(key(Value::Int64(-1)) < key(Value::Int64(0)));
        assert!(key(Value::Int64(7)) < key(Value::Int64(300)));
        assert!(key(Value::Float64(-2.5)) < key(Value::Float64(-0.5)));
        assert!(key(Value::Float64(-0.5)) < key(Value::Float64(1.0)));
    }

    #[test]
    fn equal_floats_share_one_key() {
        assert_eq!(key(Value::Float64(-0.0)), key(Value::Float64(0.0)));
        assert_eq!(key(Value::Float64(f64::NAN)), key(Value::Float64(-f64::NAN)));
        assert!(key(Value::Float64(-1e-300)) < key(Value::Float64(0.0)));
        assert!(key(Value::Float64(0.0)) < key(Value::Float64(1e-300)));
    }

    #[test]
    fn string_keys_sort_lexicographically_with_prefixes() {
        assert!(key(Value::Utf8("ab".into())) < key(Value::Utf8("abc".into())));
        assert!(key(Value::Utf8("abc".into())) < key(Value::Utf8("abd".into())));
        assert!(key(Value::Bytes(vec![1, 0])) < key(Value::Bytes(vec![1, 0, 0])));
    }

    #[test]
    fn rows_stay_inside_the_table_range() {
        let schema = TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("name", DataType::Utf8),
        ]);
        let codec = TableCodec::new(TableId(3), schema).expect("codec");
        let row = vec![Value::Int64(9), Value::Utf8("x".into())];
        let k = codec.encode_key(&row).expect("key");
        assert!(table_range(TableId(3)).contains(&k));
        assert!(!table_range(TableId(4)).contains(&k));
        let bytes = codec.encode_row(&row).expect("row");
        assert_eq!(codec.decode_row(&bytes).expect("decode"), row);
    }

    #[test]
    fn vector_keys_are_rejected() {
        let mut out = Vec::new();
        assert!(encode_key_value(&mut out, &Value::VectorF32(vec![1.0])).is_err());
    }
}
