//! # redisqueue
//!
//! JSON envelopes, trace propagation and a worker pool over a Redis-backed
//! task queue.
//!
//! ## Features
//!
//! - Publish any `Serialize` value to a named queue, wrapped in an envelope
//! - W3C trace context carried in the envelope headers across the queue hop
//! - Fixed-size worker pool per queue with graceful, optionally bounded, drain
//! - Retry with exponential backoff and a dead letter queue (engine side)
//! - Prometheus metrics and structured logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redisqueue::lifecycle::{run_until, shutdown_signal};
//! use redisqueue::processor::{handler_fn, Context};
//! use redisqueue::{
//!     Publisher, PublisherConfig, RedisBroker, RedisConfig, Subscriber, SubscriberConfig,
//!     Telemetry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(RedisBroker::connect(&RedisConfig::from_env()?).await?);
//!     let telemetry = Telemetry::default();
//!
//!     // Publisher side
//!     let publisher = Publisher::new(broker.clone(), telemetry.clone(), PublisherConfig::default());
//!     publisher
//!         .publish(&Context::from_current(), "emails", &serde_json::json!({"to": "a@b.c"}))
//!         .await?;
//!
//!     // Subscriber side
//!     let subscriber = Subscriber::new(
//!         broker,
//!         telemetry,
//!         "mailer",
//!         "emails",
//!         handler_fn(|_ctx: Context, content: Vec<u8>| async move {
//!             tracing::info!(content = %String::from_utf8_lossy(&content), "sending");
//!             Ok(())
//!         }),
//!         SubscriberConfig::default(),
//!     )?;
//!
//!     run_until(Arc::new(subscriber), shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Public module exports
pub mod envelope;
pub mod error;
pub mod task;

// Queue engine
pub mod broker;

// Storage layer
pub mod storage;

// Publish / consume
pub mod publisher;
pub mod subscriber;
pub mod lifecycle;

// Processor
pub mod processor;

// Observability
pub mod observability;

// Re-export common types
pub use broker::{Broker, FailOutcome, MemoryBroker, QueueStats, RedisBroker};
pub use error::{Error, Result};
pub use observability::{QueueMetrics, Telemetry};
pub use publisher::{Publisher, PublisherConfig};
pub use storage::RedisConfig;
pub use subscriber::{Subscriber, SubscriberBuilder, SubscriberConfig, SubscriberState};
pub use task::{Task, TaskInfo, TaskStatus};
