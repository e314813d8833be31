//! Engine-side task record
//!
//! A task wraps one published envelope together with its retry budget and
//! delivery bookkeeping. The queue name doubles as the task type, so a
//! subscriber's handler is looked up under the queue it consumes.

use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Largest envelope accepted by the engine (512KB)
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024;

/// Longest wait between two deliveries of the same task
const MAX_RETRY_DELAY: Duration = Duration::from_secs(64);

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker slot
    #[default]
    Pending,
    /// Handed to a worker
    Active,
    /// Failed, waiting for its retry delay
    Retry,
    /// Out of retries
    Dead,
}

impl TaskStatus {
    /// Lowercase name, as stored and displayed
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Retry => "retry",
            TaskStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published envelope as held by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUID v4
    pub id: String,
    /// Routing key for the handler registry; equal to `queue`
    pub task_type: String,
    /// Queue the task was published to
    pub queue: String,
    /// Encoded envelope
    pub payload: Vec<u8>,
    /// Retries allowed after the first failed delivery
    pub max_retry: u32,
    /// Retries consumed so far
    pub retry_cnt: u32,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds, set once the engine accepted the task
    pub enqueued_at: Option<i64>,
    /// Unix seconds, start of the latest delivery
    pub processed_at: Option<i64>,
    /// Error reported by the latest failed delivery
    pub last_error: Option<String>,
}

impl Task {
    /// Pending task for `queue` carrying `payload`
    pub fn new(queue: impl Into<String>, payload: Vec<u8>, max_retry: u32) -> Self {
        let queue = queue.into();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: queue.clone(),
            queue,
            payload,
            max_retry,
            retry_cnt: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now().timestamp(),
            enqueued_at: None,
            processed_at: None,
            last_error: None,
        }
    }

    /// Reject tasks the engine cannot route or store
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::Validation("queue cannot be empty".into()));
        }
        match self.payload.len() {
            0 => Err(Error::Validation("payload cannot be empty".into())),
            len if len > MAX_PAYLOAD_SIZE => Err(Error::Validation(format!(
                "payload of {}B exceeds the {}KB limit",
                len,
                MAX_PAYLOAD_SIZE / 1024
            ))),
            _ => Ok(()),
        }
    }

    /// Whether a failed delivery may be retried
    pub fn can_retry(&self) -> bool {
        self.retry_cnt < self.max_retry
    }

    /// Delay before the next delivery, or `None` once the budget is spent
    ///
    /// Doubles from 2s with every retry consumed, up to 64s.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.can_retry().then(|| {
            let exponent = self.retry_cnt.saturating_add(1).min(6);
            Duration::from_secs(1 << exponent).min(MAX_RETRY_DELAY)
        })
    }

    /// Handle returned to the publisher
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            queue: self.queue.clone(),
            task_type: self.task_type.clone(),
            max_retry: self.max_retry,
            status: self.status,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// What the engine reports back for an accepted task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task ID
    pub id: String,
    /// Queue name
    pub queue: String,
    /// Task type
    pub task_type: String,
    /// Retry budget
    pub max_retry: u32,
    /// Status when the handle was taken
    pub status: TaskStatus,
    /// Unix seconds
    pub enqueued_at: Option<i64>,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} queue={} type={} max_retry={} status={}",
            self.id, self.queue, self.task_type, self.max_retry, self.status
        )
    }
}
