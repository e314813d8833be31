//! Publish one message and consume it in the same process
//!
//! Run with a Redis server available:
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 cargo run -p redisqueue --example publish_subscribe
//! ```

use redisqueue::lifecycle::Controller;
use redisqueue::observability::logging::{self, LogConfig};
use redisqueue::processor::{handler_fn, Context};
use redisqueue::{
    Error, Publisher, PublisherConfig, RedisBroker, RedisConfig, Subscriber, SubscriberConfig,
    Telemetry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const APP_NAME: &str = "example-redis-queue";
const APP_ENV: &str = "local";
const EXAMPLE_QUEUE_NAME: &str = "example-queue";

#[derive(Debug, Serialize, Deserialize)]
struct DoSomethingMessage {
    do_what: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&LogConfig::new(APP_NAME, APP_ENV).with_pretty_print())?;

    let broker = Arc::new(RedisBroker::connect(&RedisConfig::from_env()?).await?);
    let telemetry = Telemetry::new(APP_NAME);

    // Subscriber part
    let subscriber = Subscriber::new(
        broker.clone(),
        telemetry.clone(),
        APP_NAME,
        EXAMPLE_QUEUE_NAME,
        handler_fn(|_ctx: Context, content: Vec<u8>| async move {
            let payload: DoSomethingMessage = serde_json::from_slice(&content)
                .map_err(|e| Error::Handler(format!("decode content: {}", e)))?;

            tracing::info!(?payload, "doSomething");
            Ok(())
        }),
        SubscriberConfig::default().with_concurrency(10),
    )?;
    let controller = Controller::spawn(Arc::new(subscriber));

    // Publisher part
    let publisher = Publisher::new(broker, telemetry, PublisherConfig::default().with_max_retry(5));

    let message = DoSomethingMessage {
        do_what: "Do something".to_string(),
    };
    if let Err(e) = publisher
        .publish(&Context::from_current(), EXAMPLE_QUEUE_NAME, &message)
        .await
    {
        tracing::error!(error = %e, "Failed to publish message");
    }

    // Give the subscriber time to process the message
    tokio::time::sleep(Duration::from_secs(5)).await;

    controller.shutdown().await?;
    Ok(())
}
