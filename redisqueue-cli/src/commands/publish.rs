//! Publish command handler

use clap::Args;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use redisqueue::processor::Context;
use redisqueue::{Broker, Publisher, PublisherConfig, Telemetry};
use std::sync::Arc;

/// Arguments of `redisqueue publish`
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Queue name
    pub queue: String,

    /// Message content as JSON, e.g. '{"do_what":"x"}'
    pub content: String,

    /// Maximum number of retries upon consume
    #[arg(long, default_value_t = 5)]
    pub max_retry: u32,

    /// Publish the same message this many times
    #[arg(long, default_value_t = 1)]
    pub count: usize,
}

/// Parse the content argument as JSON
pub fn parse_content(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).wrap_err_with(|| format!("content is not valid JSON: {}", raw))
}

/// Publish the message and print each task handle
pub async fn run(broker: Arc<dyn Broker>, args: PublishArgs) -> Result<()> {
    if args.count == 0 {
        return Err(eyre!("--count must be at least 1"));
    }
    let content = parse_content(&args.content)?;

    let publisher = Publisher::new(
        broker,
        Telemetry::new("redisqueue-cli"),
        PublisherConfig::default().with_max_retry(args.max_retry),
    );

    let ctx = Context::from_current();
    for _ in 0..args.count {
        let info = publisher.publish(&ctx, &args.queue, &content).await?;
        println!("Published: {}", info);
    }

    Ok(())
}
