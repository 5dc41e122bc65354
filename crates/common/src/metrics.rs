use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    shard_requests: CounterVec,
    shard_failures: CounterVec,
    replica_retries: CounterVec,
    shard_group_failures: CounterVec,
    phase_time_seconds: HistogramVec,
    throttle_queued_tasks: GaugeVec,
    search_cancellations: CounterVec,
    freed_contexts: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_shard_requests(&self, phase: &str) {
        self.inner.shard_requests.with_label_values(&[phase]).inc();
    }

    pub fn inc_shard_failures(&self, phase: &str) {
        self.inner.shard_failures.with_label_values(&[phase]).inc();
    }

    pub fn inc_replica_retries(&self, phase: &str) {
        self.inner.replica_retries.with_label_values(&[phase]).inc();
    }

    pub fn inc_shard_group_failures(&self, phase: &str) {
        self.inner
            .shard_group_failures
            .with_label_values(&[phase])
            .inc();
    }

    pub fn observe_phase_time(&self, phase: &str, secs: f64) {
        self.inner
            .phase_time_seconds
            .with_label_values(&[phase])
            .observe(secs.max(0.0));
    }

    pub fn set_throttle_queued_tasks(&self, node: &str, queued: u64) {
        self.inner
            .throttle_queued_tasks
            .with_label_values(&[node])
            .set(queued as f64);
    }

    pub fn inc_search_cancellations(&self, source: &str) {
        self.inner
            .search_cancellations
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_freed_contexts(&self, phase: &str) {
        self.inner.freed_contexts.with_label_values(&[phase]).inc();
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

        let shard_requests = counter_vec(
            &registry,
            "scatter_shard_requests_total",
            "Shard-level requests dispatched per phase",
            &["phase"],
        );
        let shard_failures = counter_vec(
            &registry,
            "scatter_shard_failures_total",
            "Failed shard attempts per phase",
            &["phase"],
        );
        let replica_retries = counter_vec(
            &registry,
            "scatter_replica_retries_total",
            "Attempts moved on to the next shard copy",
            &["phase"],
        );
        let shard_group_failures = counter_vec(
            &registry,
            "scatter_shard_group_failures_total",
            "Shards that exhausted every copy",
            &["phase"],
        );
        let phase_time_seconds = histogram_vec(
            &registry,
            "scatter_phase_time_seconds",
            "Wall time from phase start to terminal accounting",
            &["phase"],
        );

        let throttle_queued_tasks = gauge_vec(
            &registry,
            "scatter_throttle_queued_tasks",
            "Shard requests waiting for a per-node permit",
            &["node"],
        );
        let search_cancellations = counter_vec(
            &registry,
            "scatter_search_cancellations_total",
            "Remote cancellations sent, by source",
            &["source"],
        );
        let freed_contexts = counter_vec(
            &registry,
            "scatter_freed_contexts_total",
            "Search contexts released by the coordinator",
            &["phase"],
        );

        Self {
            registry,
            shard_requests,
            shard_failures,
            replica_retries,
            shard_group_failures,
            phase_time_seconds,
            throttle_queued_tasks,
            search_cancellations,
            freed_contexts,
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

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
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
