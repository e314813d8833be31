//! redisqueue CLI - publish to and work redisqueue queues

mod commands;

use clap::{Parser, Subcommand};
use redisqueue::observability::logging::{self, LogConfig};
use redisqueue::{RedisBroker, RedisConfig};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "redisqueue")]
#[command(about = "redisqueue CLI - Publish to and work Redis-backed queues", long_about = None)]
#[command(version)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = redisqueue::storage::redis::DEFAULT_REDIS_URL, global = true)]
    redis_url: String,

    /// Redis connection pool size
    #[arg(long, env = "REDIS_POOL_SIZE", default_value_t = 10, global = true)]
    pool_size: usize,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long, default_value_t = false, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a JSON message to a queue
    Publish(commands::publish::PublishArgs),
    /// Run a worker pool that logs every message of a queue
    Work(commands::work::WorkArgs),
    /// Statistics for one queue
    Stats {
        /// Queue name
        queue: String,
    },
    /// List known queues with their statistics
    Queues,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut log_config = LogConfig::new("redisqueue-cli", "local").with_level(&cli.log_level);
    if cli.pretty {
        log_config = log_config.with_pretty_print();
    }
    logging::init(&log_config)?;

    let config = RedisConfig::new(&cli.redis_url).with_pool_size(cli.pool_size);
    let broker = Arc::new(RedisBroker::connect(&config).await?);

    match cli.command {
        Commands::Publish(args) => commands::publish::run(broker, args).await?,
        Commands::Work(args) => commands::work::run(broker, args).await?,
        Commands::Stats { queue } => commands::stats::show(broker.as_ref(), &queue).await?,
        Commands::Queues => commands::stats::list(broker.as_ref()).await?,
    }

    Ok(())
}
