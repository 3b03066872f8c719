use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the gateway
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    requests: CounterVec,
    degraded_decisions: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,

    // Forwarding metrics
    upstream_errors: CounterVec,

    // Service metrics
    policy_reloads: Counter,
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests = CounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Requests handled by the gateway by outcome",
            ),
            &["service", "outcome"],
        )?;

        let degraded_decisions = CounterVec::new(
            Opts::new(
                "gateway_degraded_decisions_total",
                "Admission decisions taken while the shared store was unavailable",
            ),
            &["service", "mode"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "gateway_store_operations_total",
                "Rate limit store operations by result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_store_operation_duration_seconds",
                "Duration of rate limit store operations in seconds",
            ),
            &["operation"],
        )?;

        let upstream_errors = CounterVec::new(
            Opts::new(
                "gateway_upstream_errors_total",
                "Failed upstream calls by kind",
            ),
            &["service", "kind"],
        )?;

        let policy_reloads = Counter::new(
            "gateway_policy_reloads_total",
            "Number of successful policy reloads",
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "gateway_request_duration_seconds",
            "Duration of gateway requests in seconds",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(degraded_decisions.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;
        registry.register(Box::new(policy_reloads.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            degraded_decisions,
            store_operations,
            store_operation_duration,
            upstream_errors,
            policy_reloads,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a handled request and how it ended
    pub fn record_request(&self, service: &str, outcome: &str) {
        self.requests.with_label_values(&[service, outcome]).inc();
    }

    /// Record a decision taken without the shared store
    pub fn record_degraded_decision(&self, service: &str, mode: &str) {
        self.degraded_decisions.with_label_values(&[service, mode]).inc();
    }

    pub fn degraded_decisions(&self, service: &str, mode: &str) -> u64 {
        self.degraded_decisions.with_label_values(&[service, mode]).get() as u64
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations.with_label_values(&[operation, result]).inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a failed upstream call
    pub fn record_upstream_error(&self, service: &str, kind: &str) {
        self.upstream_errors.with_label_values(&[service, kind]).inc();
    }

    /// Record successful policy reload
    pub fn record_policy_reload(&self) {
        self.policy_reloads.inc();
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_request("a", "admitted");
        metrics.record_degraded_decision("a", "fail_open");
        metrics.record_store_operation("check_and_consume", "success");
        metrics.record_store_operation_duration("check_and_consume", 0.002);
        metrics.record_upstream_error("a", "timeout");
        metrics.record_policy_reload();

        let _timer = metrics.start_request_timer();
        assert_eq!(metrics.degraded_decisions("a", "fail_open"), 1);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();

        metrics.record_request("b", "rate_limited");

        let families = metrics.registry().gather();
        assert!(!families.is_empty());

        let found = families.iter().any(|f| f.get_name() == "gateway_requests_total");
        assert!(found);
    }
}
