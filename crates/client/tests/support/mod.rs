#![allow(dead_code)]

use std::io::Write;

use dtx_client::Engine;
use dtx_common::{EngineConfig, Location};
use dtx_storage::Catalog;
use tempfile::NamedTempFile;

pub const CATALOG: &str = r#"[
    {
        "id": 1,
        "name": "items",
        "columns": [
            {"name": "id", "data_type": "Int64", "nullable": false, "primary": true},
            {"name": "label", "data_type": "Utf8"},
            {"name": "embedding", "data_type": {"VectorF32": 2}}
        ],
        "split_keys": [[10], [20]],
        "vector_index": {"id": 1, "column": "embedding", "metric": "L2"}
    },
    {
        "id": 2,
        "name": "events",
        "columns": [
            {"name": "seq", "data_type": "Int64", "nullable": false, "primary": true},
            {"name": "kind", "data_type": "Utf8"}
        ]
    }
]"#;

pub fn write_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

pub fn engine() -> Engine {
    let catalog_file = write_file(CATALOG);
    let catalog = Catalog::load_from_json(catalog_file.path()).expect("catalog");
    Engine::new(
        catalog,
        vec![
            Location::new("node-a", 7000),
            Location::new("node-b", 7000),
            Location::new("node-c", 7000),
        ],
        EngineConfig {
            retry_backoff_base_ms: 0,
            scan_page_rows: 4,
            ..EngineConfig::default()
        },
    )
    .expect("engine")
}
