use std::collections::HashMap;
use std::fs;
use std::path::Path;

use dtx_common::{
    DtxError, IndexId, Location, PartitionId, Result, TableId, TupleSchema, Value,
};
use serde::{Deserialize, Serialize};

use crate::codec::TableCodec;
use crate::region::{RegionDescriptor, RegionEpoch};
use crate::vector_index::{AlgorithmType, MetricType};

/// Vector index declared over one vector column of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexDef {
    pub id: IndexId,
    pub column: String,
    pub metric: MetricType,
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmType,
}

fn default_algorithm() -> AlgorithmType {
    AlgorithmType::Flat
}

/// Table schema plus its initial region layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub id: TableId,
    pub name: String,
    #[serde(flatten)]
    pub schema: TupleSchema,
    /// Primary-key values at which regions split, ascending. `n` splits give `n + 1` regions.
    #[serde(default)]
    pub split_keys: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub vector_index: Option<VectorIndexDef>,
}

impl TableDef {
    pub fn codec(&self) -> Result<TableCodec> {
        TableCodec::new(self.id, self.schema.clone())
    }

    /// Encoded split keys, checked to be strictly ascending.
    fn split_points(&self, codec: &TableCodec) -> Result<Vec<Vec<u8>>> {
        let key_schema = TupleSchema::new(
            codec
                .key_indices()
                .iter()
                .map(|i| self.schema.columns[*i].clone())
                .collect(),
        );
        let mut points: Vec<Vec<u8>> = Vec::with_capacity(self.split_keys.len());
        for raw in &self.split_keys {
            let key: Vec<Value> = key_schema.parse(raw).map_err(|e| {
                DtxError::InvalidConfig(format!("table '{}' split key: {e}", self.name))
            })?;
            let encoded = codec.encode_primary_key(&key)?;
            if points.last().is_some_and(|prev| prev >= &encoded) {
                return Err(DtxError::InvalidConfig(format!(
                    "table '{}' split keys must be strictly ascending",
                    self.name
                )));
            }
            points.push(encoded);
        }
        Ok(points)
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, TableDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub fn register_table(&mut self, table: TableDef) -> Result<()> {
        if self.tables.values().any(|t| t.id == table.id && t.name != table.name) {
            return Err(DtxError::InvalidConfig(format!(
                "table id {} registered twice",
                table.id
            )));
        }
        table.codec()?;
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| DtxError::Planning(format!("unknown table: {name}")))
    }

    pub fn get_by_id(&self, id: TableId) -> Result<&TableDef> {
        self.tables
            .values()
            .find(|t| t.id == id)
            .ok_or_else(|| DtxError::Planning(format!("unknown table id: {id}")))
    }

    /// Tables ordered by id.
    pub fn tables(&self) -> Vec<&TableDef> {
        let mut out = self.tables.values().collect::<Vec<_>>();
        out.sort_by_key(|t| t.id);
        out
    }

    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let tables: Vec<TableDef> =
            serde_json::from_str(&s).map_err(|e| DtxError::InvalidConfig(e.to_string()))?;
        let mut cat = Catalog::new();
        for t in tables {
            cat.register_table(t)?;
        }
        Ok(cat)
    }

    /// Initial region layout of every table.
    ///
    /// Partition ids are assigned sequentially from 1 in table-id order; leaders are spread
    /// round-robin over `nodes` and every node is a peer of every region.
    pub fn initial_regions(&self, nodes: &[Location]) -> Result<Vec<RegionDescriptor>> {
        if nodes.is_empty() {
            return Err(DtxError::InvalidConfig(
                "at least one node is required".to_string(),
            ));
        }
        let mut out = Vec::new();
        for table in self.tables() {
            let codec = table.codec()?;
            let range = codec.range();
            let mut bounds = vec![range.start.clone()];
            bounds.extend(table.split_points(&codec)?);
            bounds.push(range.end.clone());
            for pair in bounds.windows(2) {
                let n = out.len();
                out.push(RegionDescriptor {
                    id: PartitionId(n as u64 + 1),
                    table: table.id,
                    start_key: pair[0].clone(),
                    end_key: pair[1].clone(),
                    leader: nodes[n % nodes.len()].clone(),
                    peers: nodes.to_vec(),
                    epoch: RegionEpoch::new(1, 1),
                });
            }
        }
        Ok(out)
    }
}
