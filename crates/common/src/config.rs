use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{DtxError, Result};

/// Engine-wide knobs shared by render, runtime and routing layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Domain component of job ids issued by this node.
    pub node_domain: u64,
    /// Max retries of one remote store call after routing-stale errors.
    pub max_routing_retries: u32,
    /// Base backoff between routing retries; attempt `n` waits `n * base`.
    pub retry_backoff_base_ms: u64,
    /// Bounded capacity of each vertex inbox.
    pub exchange_channel_capacity: usize,
    /// Rows fetched per remote scan page.
    pub scan_page_rows: usize,
    /// Rows submitted per ingest batch.
    pub ingest_batch_rows: usize,
    /// Lock TTL attached to pre-written keys.
    pub lock_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_domain: 1,
            max_routing_retries: 5,
            retry_backoff_base_ms: 10,
            exchange_channel_capacity: 1024,
            scan_page_rows: 256,
            ingest_batch_rows: 1000,
            lock_ttl_ms: 3_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `DTX_*` environment variables.
    ///
    /// Recognized: `DTX_NODE_DOMAIN`, `DTX_MAX_ROUTING_RETRIES`, `DTX_RETRY_BACKOFF_MS`,
    /// `DTX_CHANNEL_CAPACITY`, `DTX_SCAN_PAGE_ROWS`, `DTX_INGEST_BATCH_ROWS`, `DTX_LOCK_TTL_MS`.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            node_domain: env_or_default("DTX_NODE_DOMAIN", d.node_domain)?,
            max_routing_retries: env_or_default("DTX_MAX_ROUTING_RETRIES", d.max_routing_retries)?,
            retry_backoff_base_ms: env_or_default("DTX_RETRY_BACKOFF_MS", d.retry_backoff_base_ms)?,
            exchange_channel_capacity: env_or_default(
                "DTX_CHANNEL_CAPACITY",
                d.exchange_channel_capacity,
            )?,
            scan_page_rows: env_or_default("DTX_SCAN_PAGE_ROWS", d.scan_page_rows)?,
            ingest_batch_rows: env_or_default("DTX_INGEST_BATCH_ROWS", d.ingest_batch_rows)?,
            lock_ttl_ms: env_or_default("DTX_LOCK_TTL_MS", d.lock_ttl_ms)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would stall the runtime.
    pub fn validate(&self) -> Result<()> {
        if self.exchange_channel_capacity == 0 {
            return Err(DtxError::InvalidConfig(
                "exchange_channel_capacity must be > 0".to_string(),
            ));
        }
        if self.scan_page_rows == 0 {
            return Err(DtxError::InvalidConfig(
                "scan_page_rows must be > 0".to_string(),
            ));
        }
        if self.ingest_batch_rows == 0 {
            return Err(DtxError::InvalidConfig(
                "ingest_batch_rows must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| DtxError::InvalidConfig(format!("invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(default),
    }
}
