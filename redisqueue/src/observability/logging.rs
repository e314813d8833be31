//! Logging initialisation
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! human-readable or a JSON `fmt` layer. Library code only emits `tracing`
//! events; binaries call [`init`] once at startup.

use crate::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Application name, attached to the startup event
    pub app_name: String,
    /// Deployment environment (e.g. "local", "production")
    pub app_env: String,
    /// Human-readable output instead of JSON
    pub pretty: bool,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            app_name: "redisqueue".to_string(),
            app_env: "local".to_string(),
            pretty: false,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Create a configuration for an application
    pub fn new(app_name: impl Into<String>, app_env: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_env: app_env.into(),
            ..Self::default()
        }
    }

    /// Enable pretty printing
    #[must_use]
    pub fn with_pretty_print(mut self) -> Self {
        self.pretty = true;
        self
    }

    /// Set the default filter directive
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| Error::Config(format!("invalid log level '{}': {}", self.level, e))),
        }
    }
}

/// Install the global subscriber
///
/// Fails with [`Error::Config`] if the level directive is invalid or a
/// global subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.pretty {
        registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("logger already initialised: {}", e)))?;

    tracing::info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        "Logger initialised"
    );
    Ok(())
}
