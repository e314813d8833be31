//! Processor module
//!
//! Provides the Handler trait, a closure adapter and the multiplexer that
//! maps task types (queue names) to handlers.

pub mod context;

pub use context::Context;

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Handler trait - message processor
///
/// Receives the decoded envelope content as raw JSON bytes; the handler
/// deserializes it into whatever type it expects.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one message
    async fn handle(&self, ctx: &Context, content: &[u8]) -> Result<()>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, ctx: &Context, content: &[u8]) -> Result<()> {
        (**self).handle(ctx, content).await
    }
}

/// Handler built from an async closure, see [`handler_fn`]
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`]
///
/// # Example
///
/// ```rust
/// use redisqueue::processor::{handler_fn, Context};
///
/// let handler = handler_fn(|_ctx: Context, content: Vec<u8>| async move {
///     let value: serde_json::Value = serde_json::from_slice(&content)
///         .map_err(|e| redisqueue::Error::Handler(e.to_string()))?;
///     tracing::info!(?value, "doSomething");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, ctx: &Context, content: &[u8]) -> Result<()> {
        (self.f)(ctx.clone(), content.to_vec()).await
    }
}

/// Multiplexer - maps task types to handlers
#[derive(Clone, Default)]
pub struct Mux {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl Mux {
    /// Create a new multiplexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handler, replacing any previous one for the task type
    pub fn handle<H: Handler + 'static>(&mut self, task_type: impl Into<String>, handler: H) {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    /// Look up the handler for a task type
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Handler for Counting {
        async fn handle(&self, _ctx: &Context, _content: &[u8]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mux_routes_by_task_type() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut mux = Mux::new();
        mux.handle("emails", counting.clone());

        assert_eq!(mux.len(), 1);
        assert!(mux.get("sms").is_none());

        let handler = mux.get("emails").unwrap();
        handler.handle(&Context::new(), b"{}").await.unwrap();
        handler.handle(&Context::new(), b"{}").await.unwrap();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_fn_receives_content() {
        let handler = handler_fn(|_ctx, content| async move {
            if content == b"\"ok\"" {
                Ok(())
            } else {
                Err(Error::Handler("unexpected content".into()))
            }
        });

        assert!(handler.handle(&Context::new(), b"\"ok\"").await.is_ok());
        assert!(handler.handle(&Context::new(), b"\"no\"").await.is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut mux = Mux::new();
        mux.handle("b", Counting(AtomicUsize::new(0)));
        mux.handle("a", Counting(AtomicUsize::new(0)));
        mux.handle("a", Counting(AtomicUsize::new(0)));

        assert_eq!(mux.task_types(), vec!["a", "b"]);
    }
}
