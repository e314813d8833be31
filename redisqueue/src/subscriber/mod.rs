//! Subscriber module
//!
//! A [`Subscriber`] runs a fixed-size pool of worker slots bound to one
//! queue, plus a retry promoter. Each slot processes one delivery at a time,
//! so at most `concurrency` handler invocations are ever in flight.
//!
//! Lifecycle: `Created -> Running -> Stopping -> Stopped`. [`Subscriber::start`]
//! blocks until the pool has stopped; [`Subscriber::stop`] requests a graceful
//! drain from another task and waits for it.

pub mod config;
mod scheduler;
mod worker;

pub use config::{SubscriberBuilder, SubscriberConfig};

use crate::broker::Broker;
use crate::observability::{QueueMetrics, Telemetry};
use crate::processor::{Handler, Mux};
use crate::{Error, Result};
use scheduler::RetryPromoter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worker::{Pipeline, Worker};

/// Subscriber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Constructed, not started
    Created,
    /// Worker slots are pulling deliveries
    Running,
    /// Intake stopped, in-flight handlers draining
    Stopping,
    /// Pool exited
    Stopped,
}

impl std::fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberState::Created => write!(f, "created"),
            SubscriberState::Running => write!(f, "running"),
            SubscriberState::Stopping => write!(f, "stopping"),
            SubscriberState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Subscriber - worker pool for one queue
///
/// # Example
///
/// ```rust,no_run
/// use redisqueue::processor::{handler_fn, Context};
/// use redisqueue::subscriber::{Subscriber, SubscriberConfig};
/// use redisqueue::{MemoryBroker, Telemetry};
/// use std::sync::Arc;
///
/// # async fn example() -> redisqueue::Result<()> {
/// let subscriber = Arc::new(Subscriber::new(
///     Arc::new(MemoryBroker::new()),
///     Telemetry::default(),
///     "example-app",
///     "example-queue",
///     handler_fn(|_ctx: Context, content: Vec<u8>| async move {
///         tracing::info!(content = %String::from_utf8_lossy(&content), "doSomething");
///         Ok(())
///     }),
///     SubscriberConfig::default(),
/// )?);
///
/// let running = tokio::spawn({
///     let subscriber = subscriber.clone();
///     async move { subscriber.start().await }
/// });
///
/// subscriber.stop().await?;
/// running.await.expect("subscriber task panicked")?;
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    pipeline: Arc<Pipeline>,
    config: SubscriberConfig,
    app_name: String,
    state: watch::Sender<SubscriberState>,
    shutdown: CancellationToken,
    timed_out: AtomicBool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("app_name", &self.app_name)
            .field("queue", &self.pipeline.queue)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Create a subscriber of `queue` whose deliveries go to `handler`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on an empty queue name or invalid config.
    pub fn new<H: Handler + 'static>(
        broker: Arc<dyn Broker>,
        telemetry: Telemetry,
        app_name: impl Into<String>,
        queue: impl Into<String>,
        handler: H,
        config: SubscriberConfig,
    ) -> Result<Self> {
        SubscriberBuilder::new()
            .broker(broker)
            .telemetry(telemetry)
            .app_name(app_name)
            .queue(queue)
            .handler(handler)
            .config(config)
            .build()
    }

    pub(crate) fn from_parts(
        broker: Arc<dyn Broker>,
        telemetry: Telemetry,
        app_name: String,
        queue: String,
        mux: Mux,
        config: SubscriberConfig,
        metrics: Option<QueueMetrics>,
    ) -> Self {
        let pipeline = Pipeline {
            broker,
            telemetry,
            mux,
            span_name: format!("{}-{}-worker", app_name, queue),
            queue,
            dequeue_timeout: config.dequeue_timeout,
            metrics,
            in_flight: Default::default(),
        };

        let (state, _) = watch::channel(SubscriberState::Created);

        Self {
            pipeline: Arc::new(pipeline),
            config,
            app_name,
            state,
            shutdown: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
        }
    }

    /// Get the subscribed queue
    pub fn queue(&self) -> &str {
        &self.pipeline.queue
    }

    /// Get the application name
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Get the configuration
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Watch lifecycle state transitions
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Run the worker pool until it is stopped
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the subscriber was already started or stopped
    /// - the first fatal broker error raised by any slot
    /// - [`Error::ShutdownTimeout`] if the drain exceeded `shutdown_timeout`
    pub async fn start(&self) -> Result<()> {
        let mut current = SubscriberState::Created;
        let started = self.state.send_if_modified(|state| {
            current = *state;
            if *state == SubscriberState::Created {
                *state = SubscriberState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::InvalidState(format!(
                "cannot start subscriber in state {}",
                current
            )));
        }

        tracing::info!(
            app_name = %self.app_name,
            queue = %self.pipeline.queue,
            concurrency = self.config.concurrency,
            "Starting subscriber"
        );

        let result = self.run_pool().await;

        self.state.send_replace(SubscriberState::Stopped);
        match &result {
            Ok(()) => tracing::info!(queue = %self.pipeline.queue, "Subscriber stopped"),
            Err(e) => tracing::error!(queue = %self.pipeline.queue, error = %e, "Subscriber stopped"),
        }
        result
    }

    /// Stop intake and wait for in-flight handlers to finish
    ///
    /// Before [`start`](Self::start) this moves straight to `Stopped`; after
    /// the pool has exited it returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if the drain exceeded `shutdown_timeout`.
    pub async fn stop(&self) -> Result<()> {
        let mut previous = SubscriberState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            let next = match *state {
                SubscriberState::Created => SubscriberState::Stopped,
                SubscriberState::Running => SubscriberState::Stopping,
                other => other,
            };
            let changed = next != *state;
            *state = next;
            changed
        });
        self.shutdown.cancel();

        match previous {
            SubscriberState::Created | SubscriberState::Stopped => return Ok(()),
            SubscriberState::Running | SubscriberState::Stopping => {}
        }

        tracing::info!(queue = %self.pipeline.queue, "Shutting down subscriber...");

        let mut receiver = self.state.subscribe();
        receiver
            .wait_for(|state| *state == SubscriberState::Stopped)
            .await
            .map(|_| ())
            .map_err(|_| Error::InvalidState("subscriber state channel closed".into()))?;

        if self.timed_out.load(Ordering::SeqCst) {
            if let Some(limit) = self.config.shutdown_timeout {
                return Err(Error::ShutdownTimeout(limit));
            }
        }
        Ok(())
    }

    async fn run_pool(&self) -> Result<()> {
        let mut slots = JoinSet::new();

        for index in 0..self.config.concurrency {
            let worker = Worker::new(
                format!("{}-worker-{}", self.pipeline.queue, index),
                self.pipeline.clone(),
                self.shutdown.clone(),
            );
            slots.spawn(worker.run());
        }

        let promoter = RetryPromoter::new(
            self.pipeline.broker.clone(),
            self.pipeline.queue.clone(),
            self.config.retry_poll_interval,
            self.pipeline.metrics.clone(),
            self.shutdown.clone(),
        );
        slots.spawn(promoter.run());

        // Leases keep renewing through the drain
        let leases_stop = CancellationToken::new();
        let leases = tokio::spawn(self.pipeline.clone().keep_leases(leases_stop.clone()));

        tracing::debug!("Started {} workers", self.config.concurrency);

        // Running until stop() or the first slot exits with an error
        let mut result = Ok(());
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            failure = first_failure(&mut slots) => {
                if let Err(e) = failure {
                    tracing::error!("Worker pool failed, stopping: {}", e);
                    result = Err(e);
                }
                self.state.send_if_modified(|state| {
                    if *state == SubscriberState::Running {
                        *state = SubscriberState::Stopping;
                        true
                    } else {
                        false
                    }
                });
                self.shutdown.cancel();
            }
        }

        // Drain
        let drained = match self.config.shutdown_timeout {
            None => drain(&mut slots).await,
            Some(limit) => match tokio::time::timeout(limit, drain(&mut slots)).await {
                Ok(drained) => drained,
                Err(_) => {
                    tracing::warn!(
                        "Shutdown timeout after {:?}, aborting {} slots",
                        limit,
                        slots.len()
                    );
                    slots.abort_all();
                    while slots.join_next().await.is_some() {}
                    self.timed_out.store(true, Ordering::SeqCst);
                    Err(Error::ShutdownTimeout(limit))
                }
            },
        };

        leases_stop.cancel();
        if let Err(e) = leases.await {
            tracing::error!("Lease renewal task failed: {}", e);
        }
        self.pipeline.requeue_in_flight().await;

        match (result, drained) {
            (Err(fatal), Err(timeout @ Error::ShutdownTimeout(_))) => {
                // The timeout is what start() and stop() report
                tracing::error!(
                    queue = %self.pipeline.queue,
                    error = %fatal,
                    "Worker pool failed before shutdown timed out"
                );
                Err(timeout)
            }
            (result, drained) => result.and(drained),
        }
    }
}

/// Wait until a slot fails; resolves with `Ok` only if every slot exited cleanly
async fn first_failure(slots: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = slots.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::Unknown(format!("worker task failed: {}", e))),
        }
    }
    Ok(())
}

/// Wait for the remaining slots, keeping the first error
async fn drain(slots: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut result = Ok(());
    while let Some(joined) = slots.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Unknown(format!("worker task failed: {}", e))),
        };
        if let Err(e) = outcome {
            tracing::error!("Worker error during shutdown: {}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::processor::handler_fn;
    use std::time::Duration;

    fn subscriber(broker: &MemoryBroker) -> Arc<Subscriber> {
        let subscriber = SubscriberBuilder::new()
            .broker(Arc::new(broker.clone()))
            .queue("q")
            .concurrency(2)
            .dequeue_timeout(Duration::from_millis(20))
            .retry_poll_interval(Duration::from_millis(20))
            .handler(handler_fn(|_ctx, _content| async { Ok(()) }))
            .build()
            .unwrap();
        Arc::new(subscriber)
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let subscriber = subscriber(&MemoryBroker::new());
        assert_eq!(subscriber.state(), SubscriberState::Created);

        subscriber.stop().await.unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        assert!(matches!(subscriber.start().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let subscriber = subscriber(&MemoryBroker::new());
        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.start().await }
        });

        let mut state = subscriber.watch_state();
        state
            .wait_for(|s| *s == SubscriberState::Running)
            .await
            .unwrap();

        assert!(matches!(subscriber.start().await, Err(Error::InvalidState(_))));

        subscriber.stop().await.unwrap();
        assert!(running.await.unwrap().is_ok());
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_start() {
        let broker = MemoryBroker::new();
        let subscriber = subscriber(&broker);
        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.start().await }
        });

        broker.close();

        assert!(matches!(running.await.unwrap(), Err(Error::BrokerClosed)));
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        subscriber.stop().await.unwrap();
    }

    /// Log sink shared with a fmt subscriber
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_logged_when_drain_times_out() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish(),
        );

        let broker = MemoryBroker::new();
        let started = Arc::new(tokio::sync::Notify::new());
        let handler = {
            let started = started.clone();
            handler_fn(move |_ctx, _content| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            })
        };
        let subscriber = Arc::new(
            SubscriberBuilder::new()
                .broker(Arc::new(broker.clone()))
                .queue("q")
                .concurrency(2)
                .dequeue_timeout(Duration::from_millis(20))
                .retry_poll_interval(Duration::from_millis(20))
                .shutdown_timeout(Duration::from_millis(100))
                .handler(handler)
                .build()
                .unwrap(),
        );
        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.start().await }
        });

        let payload = crate::envelope::encode(&serde_json::json!({}), Default::default()).unwrap();
        broker.enqueue("q", payload, 0).await.unwrap();
        started.notified().await;

        // The idle slot fails on the closed broker while the other is stuck
        broker.close();

        assert!(matches!(running.await.unwrap(), Err(Error::ShutdownTimeout(_))));
        let logs = logs.contents();
        assert!(logs.contains("Worker pool failed before shutdown timed out"));
        assert!(logs.contains("Broker closed"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SubscriberState::Stopping.to_string(), "stopping");
    }
}
