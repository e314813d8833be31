//! Publisher
//!
//! Wraps content in an envelope, attaches the caller's trace context and
//! submits it to a queue. The queue name doubles as the task type.

use crate::broker::Broker;
use crate::envelope;
use crate::observability::{QueueMetrics, Telemetry};
use crate::processor::Context;
use crate::task::TaskInfo;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

/// Publisher configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Maximum number of retries upon consume
    pub max_retry: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { max_retry: 5 }
    }
}

impl PublisherConfig {
    /// Set maximum retry count
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }
}

/// Publisher
///
/// Cheap to clone; clones share the broker handle.
///
/// # Example
///
/// ```rust,no_run
/// use redisqueue::{MemoryBroker, Publisher, PublisherConfig, Telemetry};
/// use redisqueue::processor::Context;
/// use std::sync::Arc;
///
/// # async fn example() -> redisqueue::Result<()> {
/// let publisher = Publisher::new(
///     Arc::new(MemoryBroker::new()),
///     Telemetry::default(),
///     PublisherConfig::default(),
/// );
///
/// let info = publisher
///     .publish(&Context::from_current(), "emails", &serde_json::json!({"to": "a@b.c"}))
///     .await?;
/// println!("Published: {}", info);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    telemetry: Telemetry,
    config: PublisherConfig,
    metrics: Option<QueueMetrics>,
}

impl Publisher {
    /// Create a new publisher
    pub fn new(broker: Arc<dyn Broker>, telemetry: Telemetry, config: PublisherConfig) -> Self {
        Self {
            broker,
            telemetry,
            config,
            metrics: None,
        }
    }

    /// Record publish counters into a metrics collector
    #[must_use]
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish content to a queue
    ///
    /// Fails with [`Error::Validation`] on an empty queue name and with
    /// [`Error::Cancelled`] if `ctx` is already cancelled, both before the
    /// engine is contacted. Engine failures are returned as
    /// [`Error::Enqueue`]; there is no retry on submission.
    pub async fn publish<T>(&self, ctx: &Context, queue: &str, content: &T) -> Result<TaskInfo>
    where
        T: Serialize + ?Sized + Sync,
    {
        if queue.is_empty() {
            return Err(Error::Validation("queue name cannot be empty".into()));
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let trace = self.telemetry.inject(ctx.trace());
        let payload = envelope::encode(content, trace)?;

        tracing::info!(
            queue,
            payload = %String::from_utf8_lossy(&payload),
            "Publishing to queue..."
        );

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            result = self.broker.enqueue(queue, payload, self.config.max_retry) => result,
        };

        match result {
            Ok(info) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(queue);
                }
                tracing::info!(queue, task_id = %info.id, task_info = %info, "Published to queue");
                Ok(info)
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure(queue);
                }
                Err(Error::Enqueue {
                    queue: queue.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}
