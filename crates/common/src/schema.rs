//! Table row schemas and raw-row conversion.

use serde::{Deserialize, Serialize};

use crate::error::{DtxError, Result};
use crate::value::{DataType, Tuple, Value};

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Part of the primary key; key columns are encoded into the store key in schema order.
    #[serde(default)]
    pub primary: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary: false,
        }
    }

    /// Non-null primary-key column.
    pub fn key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            primary: true,
        }
    }
}

/// Ordered column list of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleSchema {
    pub columns: Vec<ColumnDef>,
}

impl TupleSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Indices of primary-key columns, in schema order.
    pub fn key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary)
            .map(|(i, _)| i)
            .collect()
    }

    /// Converts one raw untyped row into a typed tuple.
    ///
    /// Strings are parsed according to the column type, so delimited text and JSON
    /// records both convert through here.
    pub fn parse(&self, raw: &[serde_json::Value]) -> Result<Tuple> {
        if raw.len() != self.arity() {
            return Err(DtxError::Execution(format!(
                "row arity {} does not match schema arity {}",
                raw.len(),
                self.arity()
            )));
        }
        self.columns
            .iter()
            .zip(raw)
            .map(|(col, v)| convert(col, v))
            .collect()
    }

    /// Checks that an already typed tuple fits this schema.
    pub fn check(&self, tuple: &[Value]) -> Result<()> {
        if tuple.len() != self.arity() {
            return Err(DtxError::Execution(format!(
                "tuple arity {} does not match schema arity {}",
                tuple.len(),
                self.arity()
            )));
        }
        for (col, v) in self.columns.iter().zip(tuple) {
            match v.data_type() {
                None if !col.nullable => {
                    return Err(DtxError::Execution(format!(
                        "column '{}' is not nullable",
                        col.name
                    )));
                }
                Some(dt) if dt != col.data_type => {
                    return Err(DtxError::Execution(format!(
                        "column '{}' expects {}, got {dt}",
                        col.name, col.data_type
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn convert(col: &ColumnDef, raw: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as J;

    let mismatch = || {
        DtxError::Execution(format!(
            "cannot convert {raw} to {} for column '{}'",
            col.data_type, col.name
        ))
    };

    if raw.is_null() || raw.as_str().is_some_and(|s| s.is_empty() && col.data_type != DataType::Utf8) {
        return if col.nullable {
            Ok(Value::Null)
        } else {
            Err(DtxError::Execution(format!(
                "column '{}' is not nullable",
                col.name
            )))
        };
    }

    match (col.data_type, raw) {
        (DataType::Boolean, J::Bool(b)) => Ok(Value::Boolean(*b)),
        (DataType::Boolean, J::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Boolean(true)),
            "false" | "0" => Ok(Value::Boolean(false)),
            _ => Err(mismatch()),
        },
        (DataType::Int64, J::Number(n)) => n.as_i64().map(Value::Int64).ok_or_else(mismatch),
        (DataType::Int64, J::String(s)) => {
            s.trim().parse().map(Value::Int64).map_err(|_| mismatch())
        }
        (DataType::Float64, J::Number(n)) => n.as_f64().map(Value::Float64).ok_or_else(mismatch),
        (DataType::Float64, J::String(s)) => {
            s.trim().parse().map(Value::Float64).map_err(|_| mismatch())
        }
        (DataType::Utf8, J::String(s)) => Ok(Value::Utf8(s.clone())),
        (DataType::Utf8, J::Number(n)) => Ok(Value::Utf8(n.to_string())),
        (DataType::Utf8, J::Bool(b)) => Ok(Value::Utf8(b.to_string())),
        (DataType::Bytes, J::String(s)) => Ok(Value::Bytes(s.as_bytes().to_vec())),
        (DataType::VectorF32(dim), J::Array(items)) => {
            let v = items
                .iter()
                .map(|x| x.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(mismatch)?;
            if v.len() != dim {
                return Err(mismatch());
            }
            Ok(Value::VectorF32(v))
        }
        (DataType::VectorF32(_), J::String(s)) => {
            let parsed: serde_json::Value = serde_json::from_str(s).map_err(|_| mismatch())?;
            match parsed {
                J::Array(_) => convert(col, &parsed),
                _ => Err(mismatch()),
            }
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ColumnDef, TupleSchema};
    use crate::value::{DataType, Value};

    fn users() -> TupleSchema {
        TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("name", DataType::Utf8),
            ColumnDef::new("score", DataType::Float64),
            ColumnDef::new("emb", DataType::VectorF32(2)),
        ])
    }

    #[test]
    fn parses_text_and_json_cells() {
        let schema = users();
        let row = schema
            .parse(&[json!("7"), json!("ann"), json!(1.5), json!("[0.5, 1]")])
            .expect("parse");
        assert_eq!(
            row,
            vec![
                Value::Int64(7),
                Value::Utf8("ann".into()),
                Value::Float64(1.5),
                Value::VectorF32(vec![0.5, 1.0]),
            ]
        );
    }

    #[test]
    fn rejects_null_key_and_wrong_dimension() {
        let schema = users();
        assert!(schema
            .parse(&[json!(null), json!("a"), json!(1), json!([1, 2])])
            .is_err());
        assert!(schema
            .parse(&[json!(1), json!("a"), json!(1), json!([1, 2, 3])])
            .is_err());
    }

    #[test]
    fn empty_text_is_null_for_nullable_non_text_columns() {
        let schema = users();
        let row = schema
            .parse(&[json!(1), json!(""), json!(""), json!(null)])
            .expect("parse");
        assert_eq!(row[1], Value::Utf8(String::new()));
        assert_eq!(row[2], Value::Null);
        assert_eq!(schema.key_indices(), vec![0]);
    }
}
