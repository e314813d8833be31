//! Prometheus metrics collector for redisqueue
//!
//! Provides publish and consume metrics for monitoring and observability.

use crate::broker::QueueStats;
use crate::Result;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

/// redisqueue metrics collector
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct QueueMetrics {
    registry: Arc<Registry>,

    // Publish counters
    published_total: IntCounterVec,
    publish_failures_total: IntCounterVec,

    // Consume counters
    processed_total: IntCounterVec,
    failed_total: IntCounterVec,
    malformed_total: IntCounterVec,

    // Handler timing
    handler_duration_seconds: HistogramVec,

    // Gauges
    in_flight: IntGaugeVec,
    queue_tasks: IntGaugeVec,
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}

impl QueueMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registering into an existing registry
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let published_total = IntCounterVec::new(
            Opts::new("redisqueue_published_total", "Total number of messages published"),
            &["queue"],
        )?;

        let publish_failures_total = IntCounterVec::new(
            Opts::new(
                "redisqueue_publish_failures_total",
                "Total number of publish calls rejected by the queue engine",
            ),
            &["queue"],
        )?;

        let processed_total = IntCounterVec::new(
            Opts::new(
                "redisqueue_processed_total",
                "Total number of messages processed successfully",
            ),
            &["queue"],
        )?;

        let failed_total = IntCounterVec::new(
            Opts::new("redisqueue_failed_total", "Total number of failed deliveries"),
            &["queue", "outcome"],
        )?;

        let malformed_total = IntCounterVec::new(
            Opts::new(
                "redisqueue_malformed_total",
                "Total number of deliveries whose envelope could not be decoded",
            ),
            &["queue"],
        )?;

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "redisqueue_handler_duration_seconds",
                "Handler execution duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["queue"],
        )?;

        let in_flight = IntGaugeVec::new(
            Opts::new("redisqueue_in_flight", "Handler invocations currently running"),
            &["queue"],
        )?;

        let queue_tasks = IntGaugeVec::new(
            Opts::new("redisqueue_queue_tasks", "Number of tasks in queue by state"),
            &["queue", "state"],
        )?;

        registry.register(Box::new(published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(processed_total.clone()))?;
        registry.register(Box::new(failed_total.clone()))?;
        registry.register(Box::new(malformed_total.clone()))?;
        registry.register(Box::new(handler_duration_seconds.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(queue_tasks.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            published_total,
            publish_failures_total,
            processed_total,
            failed_total,
            malformed_total,
            handler_duration_seconds,
            in_flight,
            queue_tasks,
        })
    }

    /// Record a published message
    pub fn record_published(&self, queue: &str) {
        self.published_total.with_label_values(&[queue]).inc();
    }

    /// Record a publish rejected by the engine
    pub fn record_publish_failure(&self, queue: &str) {
        self.publish_failures_total.with_label_values(&[queue]).inc();
    }

    /// Record a successful delivery
    pub fn record_processed(&self, queue: &str) {
        self.processed_total.with_label_values(&[queue]).inc();
    }

    /// Record a failed delivery; `outcome` is "retry" or "dead"
    pub fn record_failed(&self, queue: &str, outcome: &str) {
        self.failed_total.with_label_values(&[queue, outcome]).inc();
    }

    /// Record a delivery with an undecodable envelope
    pub fn record_malformed(&self, queue: &str) {
        self.malformed_total.with_label_values(&[queue]).inc();
    }

    /// Start timing a handler invocation
    ///
    /// The in-flight gauge is raised until the returned timer is dropped.
    pub fn start_handler(&self, queue: &str) -> HandlerTimer {
        self.in_flight.with_label_values(&[queue]).inc();
        HandlerTimer {
            start: Instant::now(),
            metrics: self.clone(),
            queue: queue.to_string(),
        }
    }

    /// Update queue gauges from a stats snapshot
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        let queue = stats.queue.as_str();
        for (state, count) in [
            ("pending", stats.pending),
            ("active", stats.active),
            ("retry", stats.retry),
            ("dead", stats.dead),
        ] {
            self.queue_tasks
                .with_label_values(&[queue, state])
                .set(count as i64);
        }
    }

    /// Get the registry for custom metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

/// Timer for one handler invocation, see [`QueueMetrics::start_handler`]
pub struct HandlerTimer {
    start: Instant,
    metrics: QueueMetrics,
    queue: String,
}

impl Drop for HandlerTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .handler_duration_seconds
            .with_label_values(&[self.queue.as_str()])
            .observe(duration);
        self.metrics.in_flight.with_label_values(&[self.queue.as_str()]).dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        assert!(QueueMetrics::new().is_ok());
    }

    #[test]
    fn test_record_published() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.record_published("emails");
        metrics.record_publish_failure("emails");

        let output = metrics.gather();
        assert!(output.contains("redisqueue_published_total{queue=\"emails\"} 1"));
        assert!(output.contains("redisqueue_publish_failures_total{queue=\"emails\"} 1"));
    }

    #[test]
    fn test_handler_timer_tracks_in_flight() {
        let metrics = QueueMetrics::new().unwrap();

        let timer = metrics.start_handler("emails");
        assert!(metrics.gather().contains("redisqueue_in_flight{queue=\"emails\"} 1"));

        drop(timer);
        let output = metrics.gather();
        assert!(output.contains("redisqueue_in_flight{queue=\"emails\"} 0"));
        assert!(output.contains("redisqueue_handler_duration_seconds_count{queue=\"emails\"} 1"));
    }

    #[test]
    fn test_update_queue_stats() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.update_queue_stats(&QueueStats {
            queue: "emails".into(),
            pending: 3,
            dead: 1,
            ..QueueStats::default()
        });

        let output = metrics.gather();
        assert!(output.contains("redisqueue_queue_tasks{queue=\"emails\",state=\"pending\"} 3"));
        assert!(output.contains("redisqueue_queue_tasks{queue=\"emails\",state=\"dead\"} 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let first = QueueMetrics::with_registry(registry.clone());
        assert!(first.is_ok());
        assert!(matches!(
            QueueMetrics::with_registry(registry),
            Err(crate::Error::Metrics(_))
        ));
    }
}
