//! Worker implementation
//!
//! Each worker slot dequeues one delivery at a time and runs it through the
//! shared [`Pipeline`]: decode the envelope, restore the trace, invoke the
//! handler inside a span and report the outcome back to the broker.
//!
//! Deliveries being processed are tracked in the pipeline so their leases can
//! be renewed, and so a delivery cut off by an aborted drain goes back to the
//! queue instead of waiting out its lease.

use crate::broker::{Broker, FailOutcome};
use crate::envelope;
use crate::observability::{QueueMetrics, Telemetry};
use crate::processor::{Context, Mux};
use crate::task::Task;
use crate::{Error, Result};
use futures::FutureExt;
use std::collections::HashMap;
use opentelemetry::trace::{Status, TraceContextExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Delay before polling again after a non-fatal dequeue error
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shortest period between two lease renewals
const MIN_LEASE_REFRESH: Duration = Duration::from_millis(10);

/// State shared by every worker slot of one subscriber
pub(crate) struct Pipeline {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) telemetry: Telemetry,
    pub(crate) mux: Mux,
    pub(crate) queue: String,
    pub(crate) span_name: String,
    pub(crate) dequeue_timeout: Duration,
    pub(crate) metrics: Option<QueueMetrics>,
    /// Deliveries handed to a slot and not yet reported, by task id
    pub(crate) in_flight: Mutex<HashMap<String, Task>>,
}

impl Pipeline {
    /// Renew the leases of in-flight deliveries until `stop` is cancelled
    ///
    /// Renews three times per lease so one slow round trip does not let a
    /// lease lapse.
    pub(crate) async fn keep_leases(self: Arc<Self>, stop: CancellationToken) {
        let period = (self.broker.lease() / 3).max(MIN_LEASE_REFRESH);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let task_ids: Vec<String> = self.in_flight.lock().await.keys().cloned().collect();
            if task_ids.is_empty() {
                continue;
            }
            if let Err(e) = self.broker.extend_leases(&self.queue, &task_ids).await {
                tracing::warn!(queue = %self.queue, error = %e, "Failed to extend leases");
            }
        }
    }

    /// Hand every unreported delivery back to the queue
    ///
    /// Returns how many were requeued. Deliveries the broker already settled
    /// are skipped.
    pub(crate) async fn requeue_in_flight(&self) -> usize {
        let unfinished: Vec<Task> = self.in_flight.lock().await.drain().map(|(_, t)| t).collect();

        let mut requeued = 0;
        for task in unfinished {
            match self.broker.requeue(&task).await {
                Ok(()) => {
                    tracing::warn!(queue = %self.queue, task_id = %task.id, "Requeued unfinished delivery");
                    requeued += 1;
                }
                Err(Error::TaskNotFound(_)) => {
                    tracing::debug!(queue = %self.queue, task_id = %task.id, "Delivery already settled");
                }
                Err(e) => {
                    tracing::error!(
                        queue = %self.queue,
                        task_id = %task.id,
                        error = %e,
                        "Failed to requeue unfinished delivery"
                    );
                }
            }
        }
        requeued
    }

    /// Process one delivery, reporting exactly one ack or fail
    ///
    /// Only fatal broker errors are returned; everything else is logged.
    pub(crate) async fn process(&self, task: Task, cancel: &CancellationToken) -> Result<()> {
        let queue = self.queue.as_str();
        let payload = String::from_utf8_lossy(&task.payload).into_owned();
        tracing::info!(queue, %payload, "Subscriber: Processing message");

        let decoded = match envelope::decode(&task.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(queue, %payload, error = %e, "Subscriber: Error when unmarshalling message");
                if let Some(metrics) = &self.metrics {
                    metrics.record_malformed(queue);
                }
                return self.report_failure(&task, &e).await;
            }
        };

        let Some(handler) = self.mux.get(&task.task_type) else {
            let e = Error::HandlerNotFound(task.task_type.clone());
            tracing::error!(queue, %payload, error = %e, "Subscriber: Error when processing message");
            return self.report_failure(&task, &e).await;
        };

        let parent = self.telemetry.extract(&decoded.trace);
        let trace = self
            .telemetry
            .start_span(&parent, self.span_name.clone(), &task.task_type);
        let ctx = Context::new()
            .with_trace(trace.clone())
            .with_cancellation(cancel.child_token());

        let timer = self.metrics.as_ref().map(|m| m.start_handler(queue));
        let outcome = AssertUnwindSafe(handler.handle(&ctx, &decoded.content))
            .catch_unwind()
            .await;
        drop(timer);

        let result = outcome.unwrap_or_else(|panic| {
            Err(Error::Handler(format!("handler panicked: {}", panic_message(&*panic))))
        });

        if let Err(e) = &result {
            trace.span().set_status(Status::error(e.to_string()));
        }
        trace.span().end();

        match result {
            Ok(()) => {
                tracing::info!(queue, %payload, "Subscriber: Processed message successfully");
                self.report_success(&task).await
            }
            Err(e) => {
                tracing::error!(queue, %payload, error = %e, "Subscriber: Error when processing message");
                self.report_failure(&task, &e).await
            }
        }
    }

    async fn report_success(&self, task: &Task) -> Result<()> {
        match self.broker.ack(task).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_processed(&self.queue);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!(queue = %self.queue, error = %e, "Failed to acknowledge task");
                Ok(())
            }
        }
    }

    async fn report_failure(&self, task: &Task, error: &Error) -> Result<()> {
        match self.broker.fail(task, &error.to_string()).await {
            Ok(FailOutcome::Retry { retry_cnt, execute_at }) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failed(&self.queue, "retry");
                }
                tracing::warn!(
                    queue = %self.queue,
                    retry_cnt,
                    max_retry = task.max_retry,
                    execute_at,
                    "Task scheduled for retry"
                );
                Ok(())
            }
            Ok(FailOutcome::Dead) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failed(&self.queue, "dead");
                }
                tracing::warn!(queue = %self.queue, "Task moved to dead letter queue");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!(queue = %self.queue, error = %e, "Failed to report task failure");
                Ok(())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker - one slot of the pool
pub(crate) struct Worker {
    id: String,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
}

impl Worker {
    pub(crate) fn new(id: String, pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> Self {
        Self {
            id,
            pipeline,
            shutdown,
        }
    }

    /// Run until shutdown is requested or a fatal error occurs
    ///
    /// Shutdown is only observed between deliveries, so a dequeued task is
    /// processed to completion unless a drain timeout aborts the slot.
    pub(crate) async fn run(self) -> Result<()> {
        let span = tracing::debug_span!("worker", worker_id = %self.id);
        async move {
            tracing::debug!("Worker starting");
            let result = self.task_loop().await;
            tracing::debug!("Worker stopped");
            result
        }
        .instrument(span)
        .await
    }

    async fn task_loop(&self) -> Result<()> {
        let pipeline = &self.pipeline;

        while !self.shutdown.is_cancelled() {
            match pipeline
                .broker
                .dequeue(&pipeline.queue, pipeline.dequeue_timeout)
                .await
            {
                Ok(Some(task)) => {
                    let task_id = task.id.clone();
                    let span = tracing::info_span!("delivery", task_id = %task_id);
                    pipeline.in_flight.lock().await.insert(task_id.clone(), task.clone());

                    // On a fatal error the delivery stays tracked for requeue
                    pipeline.process(task, &self.shutdown).instrument(span).await?;
                    pipeline.in_flight.lock().await.remove(&task_id);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("Dequeue failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Dequeue error: {}", e);
                    let backoff = e.retry_after().unwrap_or(DEQUEUE_ERROR_BACKOFF);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
            }
        }

        Ok(())
    }
}
