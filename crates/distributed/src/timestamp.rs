use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dtx_common::Result;

/// Source of transaction start and commit timestamps.
pub trait TimestampOracle: Send + Sync {
    /// Strictly greater than every timestamp this oracle returned before.
    fn next(&self) -> Result<u64>;
}

/// Node-local monotonic oracle seeded from wall-clock microseconds.
#[derive(Debug)]
pub struct LocalTimestampOracle {
    last: AtomicU64,
}

impl LocalTimestampOracle {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self::starting_at(now)
    }

    pub fn starting_at(ts: u64) -> Self {
        Self {
            last: AtomicU64::new(ts),
        }
    }
}

impl Default for LocalTimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOracle for LocalTimestampOracle {
    fn next(&self) -> Result<u64> {
        Ok(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
