use std::sync::Arc;

/// Sink for counters and gauges. The core never owns ambient globals;
/// the host injects an implementation and tests use [`NoopMetrics`] or a
/// recording fake. Tag keys must be ASCII.
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Discards everything. Default sink for tests and headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}
