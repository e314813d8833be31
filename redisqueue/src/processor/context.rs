//! Handler context module
//!
//! A [`Context`] is passed explicitly to every publish call and every
//! handler invocation. It carries the trace context and a cooperative
//! cancellation signal; nothing is read from ambient state.

use opentelemetry::trace::TraceContextExt;
use tokio_util::sync::CancellationToken;

/// Execution context for publishing and handling messages
///
/// # Example
///
/// ```rust
/// use redisqueue::processor::Context;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let ctx = Context::new().with_cancellation(token.clone());
/// assert!(!ctx.is_cancelled());
///
/// token.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Trace context to inject on publish, or restored from headers on consume
    trace: opentelemetry::Context,

    /// Cancellation signal
    cancel: CancellationToken,
}

impl Context {
    /// Create a context with no trace and no cancellation source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from the caller's current OpenTelemetry context
    pub fn from_current() -> Self {
        Self::new().with_trace(opentelemetry::Context::current())
    }

    /// Attach a trace context
    #[must_use]
    pub fn with_trace(mut self, trace: opentelemetry::Context) -> Self {
        self.trace = trace;
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the trace context
    pub fn trace(&self) -> &opentelemetry::Context {
        &self.trace
    }

    /// Hex trace id of the active span, if any
    pub fn trace_id(&self) -> Option<String> {
        let span = self.trace.span();
        let span_context = span.span_context();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }

    /// Get the cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check if the context has been cancelled
    ///
    /// Long-running handlers should check this periodically; the worker
    /// pool sets it when a graceful shutdown begins.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
