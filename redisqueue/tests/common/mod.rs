//! Common test utilities
//!
//! Shared helper functions and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use redisqueue::processor::{Context, Handler};
use redisqueue::{MemoryBroker, Publisher, PublisherConfig, SubscriberBuilder, Telemetry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Short poll interval used by fast subscribers
pub const TICK: Duration = Duration::from_millis(20);

/// Trace id carried by [`remote_trace`]
pub const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

/// Unique queue name for a test
pub fn unique_queue(test_name: &str) -> String {
    format!("test-{}-{}", test_name, uuid::Uuid::new_v4())
}

/// Trace context as if propagated from an upstream service
pub fn remote_trace() -> opentelemetry::Context {
    let span_context = SpanContext::new(
        TraceId::from_hex(TRACE_ID).unwrap(),
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    opentelemetry::Context::new().with_remote_span_context(span_context)
}

/// Publisher over a memory broker
pub fn publisher(broker: &MemoryBroker, max_retry: u32) -> Publisher {
    Publisher::new(
        Arc::new(broker.clone()),
        Telemetry::default(),
        PublisherConfig::default().with_max_retry(max_retry),
    )
}

/// Subscriber builder with short timeouts, missing only the handler
pub fn fast_subscriber(broker: &MemoryBroker, queue: &str, concurrency: usize) -> SubscriberBuilder {
    SubscriberBuilder::new()
        .broker(Arc::new(broker.clone()))
        .app_name("test-app")
        .queue(queue)
        .concurrency(concurrency)
        .dequeue_timeout(TICK)
        .retry_poll_interval(TICK)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// What a [`RecordingHandler`] saw for one invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub content: Vec<u8>,
    pub trace_id: Option<String>,
}

/// Handler recording every invocation, failing the first `fail_first` calls
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
    fail_first: usize,
    delay: Duration,
    attempts: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, ctx: &Context, content: &[u8]) -> redisqueue::Result<()> {
        self.calls.lock().unwrap().push(Call {
            content: content.to_vec(),
            trace_id: ctx.trace_id(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(redisqueue::Error::Handler(format!("attempt {} failed", attempt + 1)));
        }
        Ok(())
    }
}
