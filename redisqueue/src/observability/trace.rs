//! Trace context propagation
//!
//! [`Telemetry`] bundles the text-map propagator and tracer used to carry a
//! trace across a queue hop. The publisher injects the caller's context into
//! the envelope's `headers.trace` map; the worker extracts it and starts a
//! child span around the handler.
//!
//! The propagator is held explicitly rather than read from the global
//! OpenTelemetry state, so two publishers in one process can use different
//! formats.

use crate::envelope::TraceHeaders;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{Span, TraceContextExt, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::sync::Arc;

/// Span attribute carrying the task type
pub const TASK_TYPE_ATTRIBUTE: &str = "task.type";

/// Propagator and tracer pair
#[derive(Clone)]
pub struct Telemetry {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: Arc<BoxedTracer>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("propagator", &self.propagator)
            .finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new("redisqueue")
    }
}

impl Telemetry {
    /// W3C trace-context propagation with a tracer from the global provider
    pub fn new(tracer_name: &'static str) -> Self {
        Self {
            propagator: Arc::new(TraceContextPropagator::new()),
            tracer: Arc::new(global::tracer(tracer_name)),
        }
    }

    /// Replace the propagator
    #[must_use]
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Replace the tracer
    #[must_use]
    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Serialize a trace context into string pairs
    ///
    /// Returns an empty map when the context carries no valid span.
    pub fn inject(&self, cx: &opentelemetry::Context) -> TraceHeaders {
        let mut headers = TraceHeaders::new();
        self.propagator.inject_context(cx, &mut headers);
        headers
    }

    /// Rebuild a trace context from string pairs
    ///
    /// Unknown or invalid headers yield an empty context.
    pub fn extract(&self, headers: &TraceHeaders) -> opentelemetry::Context {
        self.propagator
            .extract_with_context(&opentelemetry::Context::new(), headers)
    }

    /// Start a child span of `parent` and return the context holding it
    ///
    /// The caller ends the span with `cx.span().end()`.
    pub fn start_span(
        &self,
        parent: &opentelemetry::Context,
        name: impl Into<String>,
        task_type: &str,
    ) -> opentelemetry::Context {
        let mut span = self.tracer.start_with_context(name.into(), parent);
        span.set_attribute(KeyValue::new(TASK_TYPE_ATTRIBUTE, task_type.to_string()));
        parent.with_span(span)
    }
}
