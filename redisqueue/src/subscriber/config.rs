//! Subscriber configuration and builder

use super::Subscriber;
use crate::broker::Broker;
use crate::observability::{QueueMetrics, Telemetry};
use crate::processor::{Handler, Mux};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Subscriber configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Number of concurrent worker slots
    pub concurrency: usize,

    /// How long a slot waits on an empty queue before re-checking for shutdown
    pub dequeue_timeout: Duration,

    /// How often due retries are moved back to the pending queue
    pub retry_poll_interval: Duration,

    /// Upper bound on the graceful drain; `None` waits for every in-flight handler
    pub shutdown_timeout: Option<Duration>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            dequeue_timeout: Duration::from_secs(1),
            retry_poll_interval: Duration::from_secs(1),
            shutdown_timeout: None,
        }
    }
}

impl SubscriberConfig {
    /// Set number of concurrent worker slots
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set dequeue timeout
    #[must_use]
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set retry poll interval
    #[must_use]
    pub fn with_retry_poll_interval(mut self, interval: Duration) -> Self {
        self.retry_poll_interval = interval;
        self
    }

    /// Bound the graceful drain
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(Error::Config("dequeue_timeout must be greater than 0".into()));
        }
        if self.retry_poll_interval.is_zero() {
            return Err(Error::Config("retry_poll_interval must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Subscriber builder
///
/// # Example
///
/// ```rust
/// use redisqueue::subscriber::SubscriberBuilder;
/// use redisqueue::processor::handler_fn;
/// use redisqueue::MemoryBroker;
/// use std::sync::Arc;
///
/// # fn example() -> redisqueue::Result<()> {
/// let subscriber = SubscriberBuilder::new()
///     .broker(Arc::new(MemoryBroker::new()))
///     .app_name("example-app")
///     .queue("example-queue")
///     .concurrency(4)
///     .handler(handler_fn(|_ctx, _content| async { Ok(()) }))
///     .build()?;
/// # let _ = subscriber;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SubscriberBuilder {
    broker: Option<Arc<dyn Broker>>,
    telemetry: Option<Telemetry>,
    app_name: Option<String>,
    queue: Option<String>,
    handler: Option<Arc<dyn Handler>>,
    mux: Mux,
    config: SubscriberConfig,
    metrics: Option<QueueMetrics>,
}

impl SubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue engine
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the trace propagator and tracer
    #[must_use]
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Set the application name used in worker span names
    #[must_use]
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Set the queue to consume
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the handler for the subscribed queue
    #[must_use]
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Route additional task types arriving on the queue
    #[must_use]
    pub fn route<H: Handler + 'static>(mut self, task_type: impl Into<String>, handler: H) -> Self {
        self.mux.handle(task_type, handler);
        self
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: SubscriberConfig) -> Self {
        self.config = config;
        self
    }

    /// Set number of concurrent worker slots
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set dequeue timeout
    #[must_use]
    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.config.dequeue_timeout = timeout;
        self
    }

    /// Set retry poll interval
    #[must_use]
    pub fn retry_poll_interval(mut self, interval: Duration) -> Self {
        self.config.retry_poll_interval = interval;
        self
    }

    /// Bound the graceful drain
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = Some(timeout);
        self
    }

    /// Record consume metrics
    #[must_use]
    pub fn metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the subscriber
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the broker or queue is missing, no
    /// handler is registered, or the configuration is invalid.
    pub fn build(self) -> Result<Subscriber> {
        self.config.validate()?;

        let broker = self
            .broker
            .ok_or_else(|| Error::Config("broker is required".into()))?;
        let queue = self
            .queue
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::Config("queue name is required".into()))?;

        let mut mux = self.mux;
        if let Some(handler) = self.handler {
            mux.handle(queue.clone(), handler);
        }
        if mux.is_empty() {
            return Err(Error::Config(format!("no handler registered for queue '{}'", queue)));
        }

        Ok(Subscriber::from_parts(
            broker,
            self.telemetry.unwrap_or_default(),
            self.app_name.unwrap_or_else(|| "redisqueue".to_string()),
            queue,
            mux,
            self.config,
            self.metrics,
        ))
    }
}
