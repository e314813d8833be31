//! Observability module
//!
//! Provides trace propagation, logging initialisation and Prometheus metrics

pub mod logging;
pub mod metrics;
pub mod trace;

pub use logging::LogConfig;
pub use metrics::QueueMetrics;
pub use trace::Telemetry;
