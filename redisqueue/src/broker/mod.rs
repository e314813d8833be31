//! Queue engine boundary
//!
//! The publisher and the worker pool never touch Redis directly: they talk to
//! a [`Broker`], which owns persistence, retry scheduling and dead-lettering.
//! [`RedisBroker`] is the production engine; [`MemoryBroker`] keeps the same
//! contract in process for tests and local runs.
//!
//! Deliveries are leased: a dequeued task stays active only while its lease
//! is extended. A consumer that dies mid-handler stops extending, and the
//! next [`Broker::recover_expired`] sweep fails the delivery so it is retried
//! or dead-lettered like any other failure.

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

use crate::task::{Task, TaskInfo};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// How long a delivery stays active without a lease extension
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// How long dead-lettered tasks are kept
pub const DEFAULT_DEAD_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Error recorded on a delivery whose lease ran out
pub const LEASE_EXPIRED: &str = "task lease expired";

/// What the engine did with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another delivery
    Retry {
        /// Retries consumed including this one
        retry_cnt: u32,
        /// Due time (Unix timestamp, seconds)
        execute_at: i64,
    },
    /// Retry budget exhausted, moved to the dead letter queue
    Dead,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Queue name
    pub queue: String,
    /// Waiting for a free worker slot
    pub pending: u64,
    /// Currently delivered to a worker
    pub active: u64,
    /// Waiting for their retry delay
    pub retry: u64,
    /// Dead-lettered
    pub dead: u64,
    /// Acknowledged deliveries
    pub processed: u64,
    /// Failed deliveries
    pub failed: u64,
}

/// Durable delivery primitive consumed by publishers and subscribers
///
/// Implementations must be safe to share across every worker slot and
/// publisher of a process.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Submit envelope bytes to a queue with a retry budget
    async fn enqueue(&self, queue: &str, payload: Vec<u8>, max_retry: u32) -> Result<TaskInfo>;

    /// Wait up to `timeout` for the next delivery on a queue
    ///
    /// A returned task is active until it is passed to [`Broker::ack`],
    /// [`Broker::fail`] or [`Broker::requeue`], or until its lease expires.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Task>>;

    /// Lease granted to a delivery by `dequeue` and by each extension
    fn lease(&self) -> Duration;

    /// Renew the lease of active deliveries; ids no longer active are skipped
    async fn extend_leases(&self, queue: &str, task_ids: &[String]) -> Result<()>;

    /// Report a successful delivery; the task is removed from the queue
    async fn ack(&self, task: &Task) -> Result<()>;

    /// Report a failed delivery; the engine retries or dead-letters it
    async fn fail(&self, task: &Task, error: &str) -> Result<FailOutcome>;

    /// Hand an unfinished delivery back to the pending queue
    ///
    /// No retry is consumed. Fails with `TaskNotFound` if the delivery was
    /// already reported or recovered.
    async fn requeue(&self, task: &Task) -> Result<()>;

    /// Move retries whose delay has elapsed back to the pending queue
    async fn promote_due(&self, queue: &str) -> Result<usize>;

    /// Fail every active delivery whose lease has expired
    async fn recover_expired(&self, queue: &str) -> Result<usize>;

    /// Drop dead letters older than the retention period
    async fn prune_dead(&self, queue: &str) -> Result<usize>;

    /// Get queue statistics
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    /// List queues known to the engine
    async fn queues(&self) -> Result<Vec<String>>;
}
