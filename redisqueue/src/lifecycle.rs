//! Subscriber lifecycle control
//!
//! [`Controller`] runs [`Subscriber::start`] on its own task and, on
//! shutdown, calls [`Subscriber::stop`] and waits for the run loop to exit.
//! [`run_until`] wires that to any shutdown future, typically
//! [`shutdown_signal`].

use crate::subscriber::{Subscriber, SubscriberState};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};

/// Handle to a subscriber running on a background task
#[derive(Debug)]
pub struct Controller {
    subscriber: Arc<Subscriber>,
    handle: JoinHandle<Result<()>>,
}

impl Controller {
    /// Start the subscriber on a new tokio task
    pub fn spawn(subscriber: Arc<Subscriber>) -> Self {
        tracing::info!(queue = %subscriber.queue(), "Starting worker...");
        let handle = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.start().await }
        });
        Self { subscriber, handle }
    }

    /// Get the controlled subscriber
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Check if the run loop has exited on its own
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the subscriber and wait for its run loop to return
    ///
    /// Returns the run loop's error if it failed, otherwise the error from
    /// stopping (a drain timeout).
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(queue = %self.subscriber.queue(), "Shutting down worker...");

        // A stop that lands before start() would make start() fail
        let mut state = self.subscriber.watch_state();
        let _ = state
            .wait_for(|state| *state != SubscriberState::Created)
            .await;

        let stopped = self.subscriber.stop().await;
        let ran = join_result(self.handle.await);

        tracing::info!(queue = %self.subscriber.queue(), "Worker shut down");
        ran.and(stopped)
    }

    /// Wait for the run loop to return without requesting a stop
    pub async fn wait(self) -> Result<()> {
        join_result(self.handle.await)
    }
}

fn join_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.unwrap_or_else(|e| Err(Error::Unknown(format!("subscriber task failed: {}", e))))
}

/// Run a subscriber until `signal` resolves, then shut it down gracefully
///
/// Returns early with the run loop's error if the pool stops on its own.
///
/// # Example
///
/// ```rust,no_run
/// use redisqueue::lifecycle::{run_until, shutdown_signal};
/// # use std::sync::Arc;
/// # async fn example(subscriber: Arc<redisqueue::Subscriber>) -> redisqueue::Result<()> {
/// run_until(subscriber, shutdown_signal()).await
/// # }
/// ```
pub async fn run_until<F>(subscriber: Arc<Subscriber>, signal: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut controller = Controller::spawn(subscriber);

    let exited = tokio::select! {
        () = signal => None,
        joined = &mut controller.handle => Some(joined),
    };

    match exited {
        None => controller.shutdown().await,
        Some(joined) => join_result(joined),
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("received SIGTERM, initiating shutdown"),
    }
}
