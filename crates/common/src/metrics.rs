use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Process-wide scheduler metrics registry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    work_orders_dispatched: CounterVec,
    work_orders_completed: CounterVec,
    work_orders_failed: CounterVec,
    queued_work_orders: GaugeVec,
    rebuilds_initiated: CounterVec,
    pipeline_messages: CounterVec,
    query_duration_seconds: HistogramVec,
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let work_orders_dispatched = CounterVec::new(
            Opts::new(
                "quarry_work_orders_dispatched_total",
                "Work orders sent to workers",
            ),
            &["query_id", "op_index", "phase"],
        )
        .expect("valid metric definition");
        let work_orders_completed = CounterVec::new(
            Opts::new(
                "quarry_work_orders_completed_total",
                "Work order completions received",
            ),
            &["query_id", "op_index", "phase"],
        )
        .expect("valid metric definition");
        let work_orders_failed = CounterVec::new(
            Opts::new(
                "quarry_work_orders_failed_total",
                "Work order failure completions received",
            ),
            &["query_id", "op_index", "phase"],
        )
        .expect("valid metric definition");
        let queued_work_orders = GaugeVec::new(
            Opts::new(
                "quarry_queued_work_orders",
                "Work orders waiting in the container",
            ),
            &["query_id", "op_index"],
        )
        .expect("valid metric definition");
        let rebuilds_initiated = CounterVec::new(
            Opts::new(
                "quarry_rebuilds_initiated_total",
                "Rebuild phases initiated per operator partition",
            ),
            &["query_id", "op_index"],
        )
        .expect("valid metric definition");
        let pipeline_messages = CounterVec::new(
            Opts::new(
                "quarry_pipeline_messages_total",
                "Data pipelining messages routed through the foreman",
            ),
            &["query_id", "op_index"],
        )
        .expect("valid metric definition");
        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quarry_query_duration_seconds",
                "Wall-clock query duration by terminal status",
            ),
            &["status"],
        )
        .expect("valid metric definition");

        registry
            .register(Box::new(work_orders_dispatched.clone()))
            .expect("register metric");
        registry
            .register(Box::new(work_orders_completed.clone()))
            .expect("register metric");
        registry
            .register(Box::new(work_orders_failed.clone()))
            .expect("register metric");
        registry
            .register(Box::new(queued_work_orders.clone()))
            .expect("register metric");
        registry
            .register(Box::new(rebuilds_initiated.clone()))
            .expect("register metric");
        registry
            .register(Box::new(pipeline_messages.clone()))
            .expect("register metric");
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .expect("register metric");

        Self {
            registry,
            work_orders_dispatched,
            work_orders_completed,
            work_orders_failed,
            queued_work_orders,
            rebuilds_initiated,
            pipeline_messages,
            query_duration_seconds,
        }
    }
}

impl MetricsRegistry {
    /// Constructs an isolated registry (tests use this; production code uses
    /// [`global_metrics`]).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Records a work-order dispatch.
    pub fn inc_dispatched(&self, query_id: u64, op_index: usize, phase: &str) {
        self.inner
            .work_orders_dispatched
            .with_label_values(&[&query_id.to_string(), &op_index.to_string(), phase])
            .inc();
    }

    /// Records a successful work-order completion.
    pub fn inc_completed(&self, query_id: u64, op_index: usize, phase: &str) {
        self.inner
            .work_orders_completed
            .with_label_values(&[&query_id.to_string(), &op_index.to_string(), phase])
            .inc();
    }

    /// Records a failure completion.
    pub fn inc_failed(&self, query_id: u64, op_index: usize, phase: &str) {
        self.inner
            .work_orders_failed
            .with_label_values(&[&query_id.to_string(), &op_index.to_string(), phase])
            .inc();
    }

    /// Updates the queued-work-orders gauge for one operator.
    pub fn set_queued(&self, query_id: u64, op_index: usize, queued: usize) {
        self.inner
            .queued_work_orders
            .with_label_values(&[&query_id.to_string(), &op_index.to_string()])
            .set(queued as f64);
    }

    /// Records a rebuild-phase initiation.
    pub fn inc_rebuild_initiated(&self, query_id: u64, op_index: usize) {
        self.inner
            .rebuilds_initiated
            .with_label_values(&[&query_id.to_string(), &op_index.to_string()])
            .inc();
    }

    /// Records a routed data-pipelining message.
    pub fn inc_pipeline_message(&self, query_id: u64, op_index: usize) {
        self.inner
            .pipeline_messages
            .with_label_values(&[&query_id.to_string(), &op_index.to_string()])
            .inc();
    }

    /// Records terminal query duration.
    pub fn observe_query_duration(&self, status: &str, secs: f64) {
        self.inner
            .query_duration_seconds
            .with_label_values(&[status])
            .observe(secs.max(0.0));
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Returns the process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
