//! Statistics command handlers
//!
//! Provides commands for displaying queue statistics.

use color_eyre::Result;
use redisqueue::{Broker, QueueStats};

/// Show statistics for a queue
pub async fn show(broker: &dyn Broker, queue: &str) -> Result<()> {
    let stats = broker.queue_stats(queue).await?;
    println!("Statistics");
    print!("{}", render(&stats));
    Ok(())
}

/// List all queues with their statistics
pub async fn list(broker: &dyn Broker) -> Result<()> {
    let queues = broker.queues().await?;
    println!("Queue List");

    if queues.is_empty() {
        println!("  (No queues)");
        return Ok(());
    }

    for queue in queues {
        let stats = broker.queue_stats(&queue).await?;
        println!(
            "  - {} (pending: {}, active: {}, retry: {}, dead: {})",
            queue, stats.pending, stats.active, stats.retry, stats.dead
        );
    }
    Ok(())
}

fn render(stats: &QueueStats) -> String {
    format!(
        "  Queue: {}\n  Pending: {}\n  Active: {}\n  Retry: {}\n  Dead: {}\n  Processed: {}\n  Failed: {}\n",
        stats.queue, stats.pending, stats.active, stats.retry, stats.dead, stats.processed, stats.failed
    )
}
