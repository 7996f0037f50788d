use std::fmt;
use std::time::Duration;

/// Receives pool events for external monitoring. Every method defaults to a
/// no-op so sinks only implement what they export.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn connection_opened(&self, _backend: &str) {}

    fn connection_closed(&self, _backend: &str) {}

    fn connection_recycled(&self, _backend: &str) {}

    fn connect_failed(&self, _backend: &str) {}

    fn request_failed(&self, _backend: &str) {}

    fn request_busy(&self, _backend: &str) {}

    fn request_completed(&self, _backend: &str, _elapsed: Duration) {}

    fn active_connections(&self, _backend: &str, _count: usize) {}

    fn idle_connections(&self, _backend: &str, _count: usize) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[cfg(feature = "metrics")]
pub use self::prometheus_sink::PrometheusMetrics;

#[cfg(feature = "metrics")]
mod prometheus_sink {
    use super::MetricsSink;
    use crate::utils::error::Result;
    use prometheus::{
        Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
        TextEncoder,
    };
    use std::time::Duration;

    /// Prometheus-backed sink owning its own registry.
    #[derive(Debug, Clone)]
    pub struct PrometheusMetrics {
        registry: Registry,
        connections_opened: IntCounterVec,
        connections_closed: IntCounterVec,
        connections_recycled: IntCounterVec,
        connect_failures: IntCounterVec,
        request_failures: IntCounterVec,
        request_busy: IntCounterVec,
        request_time: HistogramVec,
        active: IntGaugeVec,
        idle: IntGaugeVec,
    }

    impl PrometheusMetrics {
        pub fn new() -> Result<Self> {
            Self::with_registry(Registry::new())
        }

        pub fn with_registry(registry: Registry) -> Result<Self> {
            let labels = &["backend"];

            let connections_opened = IntCounterVec::new(
                Opts::new(
                    "lbpool_connections_opened_total",
                    "New TCP connections opened to a backend",
                ),
                labels,
            )?;
            let connections_closed = IntCounterVec::new(
                Opts::new(
                    "lbpool_connections_closed_total",
                    "Backend connections closed instead of pooled",
                ),
                labels,
            )?;
            let connections_recycled = IntCounterVec::new(
                Opts::new(
                    "lbpool_connections_recycled_total",
                    "Idle backend connections reused (keepalive)",
                ),
                labels,
            )?;
            let connect_failures = IntCounterVec::new(
                Opts::new(
                    "lbpool_connect_failures_total",
                    "Failed connect attempts to a backend",
                ),
                labels,
            )?;
            let request_failures = IntCounterVec::new(
                Opts::new(
                    "lbpool_request_failures_total",
                    "Socket read/write failures reported against a backend",
                ),
                labels,
            )?;
            let request_busy = IntCounterVec::new(
                Opts::new(
                    "lbpool_request_busy_total",
                    "Busy (overload) responses reported by a backend",
                ),
                labels,
            )?;
            let request_time = HistogramVec::new(
                HistogramOpts::new(
                    "lbpool_request_duration_seconds",
                    "Time a connection was held before being freed",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0,
                ]),
                labels,
            )?;
            let active = IntGaugeVec::new(
                Opts::new("lbpool_active_connections", "Connections held by callers"),
                labels,
            )?;
            let idle = IntGaugeVec::new(
                Opts::new("lbpool_idle_connections", "Connections in the idle ring"),
                labels,
            )?;

            registry.register(Box::new(connections_opened.clone()))?;
            registry.register(Box::new(connections_closed.clone()))?;
            registry.register(Box::new(connections_recycled.clone()))?;
            registry.register(Box::new(connect_failures.clone()))?;
            registry.register(Box::new(request_failures.clone()))?;
            registry.register(Box::new(request_busy.clone()))?;
            registry.register(Box::new(request_time.clone()))?;
            registry.register(Box::new(active.clone()))?;
            registry.register(Box::new(idle.clone()))?;

            Ok(Self {
                registry,
                connections_opened,
                connections_closed,
                connections_recycled,
                connect_failures,
                request_failures,
                request_busy,
                request_time,
                active,
                idle,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Render every metric in the Prometheus text exposition format.
        pub fn render(&self) -> Result<String> {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&self.registry.gather(), &mut buffer)?;
            String::from_utf8(buffer)
                .map_err(|e| crate::LbPoolError::Metrics(format!("invalid utf-8: {}", e)))
        }
    }

    impl MetricsSink for PrometheusMetrics {
        fn connection_opened(&self, backend: &str) {
            self.connections_opened.with_label_values(&[backend]).inc();
        }

        fn connection_closed(&self, backend: &str) {
            self.connections_closed.with_label_values(&[backend]).inc();
        }

        fn connection_recycled(&self, backend: &str) {
            self.connections_recycled.with_label_values(&[backend]).inc();
        }

        fn connect_failed(&self, backend: &str) {
            self.connect_failures.with_label_values(&[backend]).inc();
        }

        fn request_failed(&self, backend: &str) {
            self.request_failures.with_label_values(&[backend]).inc();
        }

        fn request_busy(&self, backend: &str) {
            self.request_busy.with_label_values(&[backend]).inc();
        }

        fn request_completed(&self, backend: &str, elapsed: Duration) {
            self.request_time
                .with_label_values(&[backend])
                .observe(elapsed.as_secs_f64());
        }

        fn active_connections(&self, backend: &str, count: usize) {
            self.active.with_label_values(&[backend]).set(count as i64);
        }

        fn idle_connections(&self, backend: &str, count: usize) {
            self.idle.with_label_values(&[backend]).set(count as i64);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn renders_recorded_events() {
            let metrics = PrometheusMetrics::new().unwrap();
            metrics.connection_opened("app-a");
            metrics.connection_opened("app-a");
            metrics.connect_failed("app-b");
            metrics.idle_connections("app-a", 3);

            let text = metrics.render().unwrap();
            assert!(text.contains("lbpool_connections_opened_total{backend=\"app-a\"} 2"));
            assert!(text.contains("lbpool_connect_failures_total{backend=\"app-b\"} 1"));
            assert!(text.contains("lbpool_idle_connections{backend=\"app-a\"} 3"));
        }

        #[test]
        fn separate_sinks_do_not_collide() {
            let first = PrometheusMetrics::new().unwrap();
            let second = PrometheusMetrics::new().unwrap();
            first.connection_closed("x");
            assert!(!second.render().unwrap().contains("backend=\"x\""));
        }
    }
}
