use std::fmt;
use std::time::{Duration, Instant};

use dtx_common::{Location, VertexId, global_metrics};
use serde::Serialize;

use crate::context::TaskContext;

/// Timing and row counters of one vertex execution.
///
/// Every pull that produced a tuple is timed with [`OperatorProfile::time`]; the profile is
/// published to metrics by [`OperatorProfile::end`].
#[derive(Debug, Clone, Serialize)]
pub struct OperatorProfile {
    /// Operator name.
    pub operator: String,
    /// Vertex the profile belongs to.
    pub vertex_id: VertexId,
    /// Node the vertex ran on.
    pub location: Location,
    /// Number of timed pulls.
    pub count: u64,
    /// Sum of timed pulls.
    pub duration: Duration,
    /// Slowest pull.
    pub max: Duration,
    /// Fastest pull; `None` before the first.
    pub min: Option<Duration>,
    /// Mean pull time, set by `end`.
    pub avg: Duration,
    /// Tuples pulled from upstream.
    pub rows_in: u64,
    /// Tuples produced.
    pub rows_out: u64,
    #[serde(skip)]
    started: Option<Instant>,
    /// Wall time between creation and `end`.
    pub wall: Duration,
}

impl OperatorProfile {
    /// Starts a profile for one vertex.
    pub fn new(operator: impl Into<String>, vertex_id: VertexId, location: Location) -> Self {
        Self {
            operator: operator.into(),
            vertex_id,
            location,
            count: 0,
            duration: Duration::ZERO,
            max: Duration::ZERO,
            min: None,
            avg: Duration::ZERO,
            rows_in: 0,
            rows_out: 0,
            started: Some(Instant::now()),
            wall: Duration::ZERO,
        }
    }

    /// Records one pull that started at `start`.
    pub fn time(&mut self, start: Instant) {
        let elapsed = start.elapsed();
        self.duration += elapsed;
        self.count += 1;
        self.max = self.max.max(elapsed);
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
    }

    /// Closes the profile and publishes it.
    pub fn end(&mut self, ctx: &TaskContext) {
        if self.count > 0 {
            self.avg = self.duration / self.count as u32;
        }
        if let Some(started) = self.started.take() {
            self.wall = started.elapsed();
        }
        global_metrics().record_operator(
            &ctx.job_id.to_string(),
            self.vertex_id.0,
            &self.operator,
            self.rows_in,
            self.rows_out,
            self.wall.as_secs_f64(),
        );
    }
}

impl fmt::Display for OperatorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{operator={}, vertex={}, count={}, duration={:?}, max={:?}, min={:?}, avg={:?}, rows_in={}, rows_out={}}}",
            self.operator,
            self.vertex_id,
            self.count,
            self.duration,
            self.max,
            self.min.unwrap_or_default(),
            self.avg,
            self.rows_in,
            self.rows_out
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use dtx_common::{EngineConfig, JobId, Location, VertexId};

    use super::OperatorProfile;
    use crate::context::TaskContext;

    #[test]
    fn tracks_min_max_and_average() {
        let mut p = OperatorProfile::new("FilterProject", VertexId(1), Location::new("n1", 1));
        p.time(Instant::now());
        p.time(Instant::now());
        p.rows_out = 2;
        let ctx = TaskContext::new(
            JobId { domain: 1, seq: 1 },
            Location::new("n1", 1),
            EngineConfig::default(),
        );
        p.end(&ctx);
        assert_eq!(p.count, 2);
        assert!(p.min.expect("min") <= p.max);
        assert!(p.avg <= p.max);
        assert!(p.to_string().contains("FilterProject"));
    }
}
