//! Retry promoter
//!
//! Runs next to the worker slots and periodically moves retries whose
//! delay has elapsed back into the pending queue. Each tick also fails
//! deliveries whose lease ran out (their consumer is gone) and drops dead
//! letters past retention. When metrics are enabled it refreshes the queue
//! gauges as well.

use crate::broker::Broker;
use crate::observability::QueueMetrics;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub(crate) struct RetryPromoter {
    broker: Arc<dyn Broker>,
    queue: String,
    interval: Duration,
    metrics: Option<QueueMetrics>,
    shutdown: CancellationToken,
}

impl RetryPromoter {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        queue: String,
        interval: Duration,
        metrics: Option<QueueMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            queue,
            interval,
            metrics,
            shutdown,
        }
    }

    /// Run until shutdown is requested or the broker reports a fatal error
    pub(crate) async fn run(self) -> Result<()> {
        tracing::debug!(queue = %self.queue, "Retry promoter started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // A sweep in progress is never interrupted
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let promoted = self.broker.promote_due(&self.queue).await;
            self.check("Moved due retries to queue", promoted)?;

            let recovered = self.broker.recover_expired(&self.queue).await;
            self.check("Recovered deliveries with expired leases", recovered)?;

            let pruned = self.broker.prune_dead(&self.queue).await;
            self.check("Pruned expired dead letters", pruned)?;

            if let Some(metrics) = &self.metrics {
                match self.broker.queue_stats(&self.queue).await {
                    Ok(stats) => metrics.update_queue_stats(&stats),
                    Err(e) => tracing::warn!("Failed to refresh queue stats: {}", e),
                }
            }
        }

        tracing::debug!(queue = %self.queue, "Retry promoter stopped");
        Ok(())
    }

    /// Log a sweep's outcome; only fatal errors stop the promoter
    fn check(&self, done: &str, swept: Result<usize>) -> Result<()> {
        match swept {
            Ok(0) => {}
            Ok(count) => tracing::debug!(queue = %self.queue, count, "{}", done),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::error!(queue = %self.queue, "Queue maintenance error: {}", e),
        }
        Ok(())
    }
}
