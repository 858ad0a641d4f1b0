use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_time_seconds: HistogramVec,
    routing_retries: CounterVec,
    phase_outcomes: CounterVec,
    ingest_rows: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_operator(
        &self,
        job_id: &str,
        vertex_id: u64,
        operator: &str,
        rows_in: u64,
        rows_out: u64,
        secs: f64,
    ) {
        let labels = [job_id, &vertex_id.to_string(), operator];
        self.inner
            .operator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    /// Counts one routing retry; `class` is the classifier verdict.
    pub fn inc_routing_retries(&self, partition_id: u64, class: &str) {
        self.inner
            .routing_retries
            .with_label_values(&[&partition_id.to_string(), class])
            .inc();
    }

    pub fn inc_phase_outcome(&self, phase: &str, outcome: &str) {
        self.inner
            .phase_outcomes
            .with_label_values(&[phase, outcome])
            .inc();
    }

    pub fn record_ingest(&self, table: &str, accepted: u64, skipped: u64) {
        self.inner
            .ingest_rows
            .with_label_values(&[table, "accepted"])
            .inc_by(accepted as f64);
        self.inner
            .ingest_rows
            .with_label_values(&[table, "skipped"])
            .inc_by(skipped as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_in = counter_vec(
            &registry,
            "dtx_operator_rows_in_total",
            "Input rows pulled per vertex operator",
            &["job_id", "vertex_id", "operator"],
        );
        let operator_rows_out = counter_vec(
            &registry,
            "dtx_operator_rows_out_total",
            "Output rows produced per vertex operator",
            &["job_id", "vertex_id", "operator"],
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "dtx_operator_time_seconds",
            "Wall time spent per vertex operator",
            &["job_id", "vertex_id", "operator"],
        );
        let routing_retries = counter_vec(
            &registry,
            "dtx_routing_retries_total",
            "Remote store calls retried after routing-stale errors",
            &["partition_id", "class"],
        );
        let phase_outcomes = counter_vec(
            &registry,
            "dtx_transaction_phase_total",
            "Transaction phase executions by outcome",
            &["phase", "outcome"],
        );
        let ingest_rows = counter_vec(
            &registry,
            "dtx_ingest_rows_total",
            "Ingested rows by outcome",
            &["table", "outcome"],
        );

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_time_seconds,
            routing_retries,
            phase_outcomes,
            ingest_rows,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
