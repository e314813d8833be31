//! Work command handler
//!
//! Runs a subscriber whose handler logs each message, until Ctrl+C or SIGTERM.

use clap::Args;
use color_eyre::Result;
use redisqueue::lifecycle::{run_until, shutdown_signal};
use redisqueue::processor::{handler_fn, Context};
use redisqueue::{Broker, SubscriberBuilder, Telemetry};
use std::sync::Arc;
use std::time::Duration;

/// Arguments of `redisqueue work`
#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Queue name
    pub queue: String,

    /// Application name used in worker span names
    #[arg(long, default_value = "redisqueue-cli")]
    pub app_name: String,

    /// Number of concurrent worker slots
    #[arg(short, long, default_value_t = 10)]
    pub concurrency: usize,

    /// Abort in-flight handlers this many seconds after shutdown starts
    #[arg(long)]
    pub shutdown_timeout: Option<u64>,
}

/// Run the worker pool until a shutdown signal arrives
pub async fn run(broker: Arc<dyn Broker>, args: WorkArgs) -> Result<()> {
    let mut builder = SubscriberBuilder::new()
        .broker(broker)
        .telemetry(Telemetry::new("redisqueue-cli"))
        .app_name(&args.app_name)
        .queue(&args.queue)
        .concurrency(args.concurrency)
        .handler(handler_fn(|ctx: Context, content: Vec<u8>| async move {
            let trace_id = ctx.trace_id().unwrap_or_else(|| "-".to_string());
            tracing::info!(
                %trace_id,
                content = %String::from_utf8_lossy(&content),
                "Received message"
            );
            Ok(())
        }));
    if let Some(secs) = args.shutdown_timeout {
        builder = builder.shutdown_timeout(Duration::from_secs(secs));
    }

    let subscriber = Arc::new(builder.build()?);
    run_until(subscriber, shutdown_signal()).await?;
    Ok(())
}
