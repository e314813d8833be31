//! In-process broker
//!
//! Same contract as the Redis broker, kept in memory. Useful for tests and
//! for running publishers and subscribers in one process without Redis.

use super::{Broker, FailOutcome, QueueStats, DEFAULT_DEAD_RETENTION, DEFAULT_LEASE, LEASE_EXPIRED};
use crate::task::{Task, TaskInfo, TaskStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug)]
struct Leased {
    task: Task,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    active: HashMap<String, Leased>,
    retry: Vec<(Instant, Task)>,
    dead: Vec<(Instant, Task)>,
    processed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    closed: AtomicBool,
}

/// In-memory [`Broker`]
///
/// Clones share the same queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    retry_delay: Option<Duration>,
    lease: Duration,
    dead_retention: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            retry_delay: None,
            lease: DEFAULT_LEASE,
            dead_retention: DEFAULT_DEAD_RETENTION,
        }
    }
}

impl MemoryBroker {
    /// Create an empty broker using the task's exponential backoff for retries
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed retry delay instead of the task's backoff
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Set the delivery lease
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set how long dead letters are kept
    #[must_use]
    pub fn with_dead_retention(mut self, retention: Duration) -> Self {
        self.dead_retention = retention;
        self
    }

    /// Close the broker
    ///
    /// Blocked and future dequeues, enqueues and background sweeps fail with
    /// [`Error::BrokerClosed`]. Deliveries already handed out can still be
    /// reported.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Check if the broker was closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the pending queue
    pub async fn pending(&self, queue: &str) -> Vec<Task> {
        let queues = self.shared.queues.lock().await;
        queues
            .get(queue)
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks in the dead letter queue
    pub async fn dead_letters(&self, queue: &str) -> Vec<Task> {
        let queues = self.shared.queues.lock().await;
        queues
            .get(queue)
            .map(|s| s.dead.iter().map(|(_, task)| task.clone()).collect())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BrokerClosed);
        }
        Ok(())
    }

    /// Record a failed delivery, scheduling a retry or dead-lettering it
    fn settle_failure(&self, state: &mut QueueState, mut task: Task, error: &str) -> FailOutcome {
        state.failed += 1;
        task.last_error = Some(error.to_string());

        match self.retry_delay.or_else(|| task.retry_delay()) {
            Some(delay) if task.can_retry() => {
                task.retry_cnt += 1;
                task.status = TaskStatus::Retry;
                let retry_cnt = task.retry_cnt;
                let execute_at = Utc::now().timestamp() + delay.as_secs() as i64;
                state.retry.push((Instant::now() + delay, task));
                FailOutcome::Retry { retry_cnt, execute_at }
            }
            _ => {
                task.status = TaskStatus::Dead;
                state.dead.push((Instant::now(), task));
                FailOutcome::Dead
            }
        }
    }
}

/// Remove a delivery from the active set
fn take_active<'a>(
    queues: &'a mut HashMap<String, QueueState>,
    task: &Task,
) -> Result<(Task, &'a mut QueueState)> {
    let state = queues
        .get_mut(&task.queue)
        .ok_or_else(|| Error::TaskNotFound(task.id.clone()))?;
    let leased = state
        .active
        .remove(&task.id)
        .ok_or_else(|| Error::TaskNotFound(task.id.clone()))?;
    Ok((leased.task, state))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>, max_retry: u32) -> Result<TaskInfo> {
        self.ensure_open()?;

        let mut task = Task::new(queue, payload, max_retry);
        task.validate()?;
        task.enqueued_at = Some(Utc::now().timestamp());
        let info = task.info();

        {
            let mut queues = self.shared.queues.lock().await;
            queues.entry(queue.to_string()).or_default().pending.push_back(task);
        }
        self.shared.notify.notify_waiters();

        tracing::debug!(task_id = %info.id, queue, "Task enqueued");
        Ok(info)
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an enqueue in between is not missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;

            {
                let mut queues = self.shared.queues.lock().await;
                if let Some(state) = queues.get_mut(queue) {
                    if let Some(mut task) = state.pending.pop_front() {
                        task.status = TaskStatus::Active;
                        task.processed_at = Some(Utc::now().timestamp());
                        let leased = Leased {
                            task: task.clone(),
                            expires_at: Instant::now() + self.lease,
                        };
                        state.active.insert(task.id.clone(), leased);
                        return Ok(Some(task));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn lease(&self) -> Duration {
        self.lease
    }

    async fn extend_leases(&self, queue: &str, task_ids: &[String]) -> Result<()> {
        let mut queues = self.shared.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(());
        };

        let expires_at = Instant::now() + self.lease;
        for id in task_ids {
            if let Some(leased) = state.active.get_mut(id) {
                leased.expires_at = expires_at;
            }
        }
        Ok(())
    }

    async fn ack(&self, task: &Task) -> Result<()> {
        let mut queues = self.shared.queues.lock().await;
        let (_, state) = take_active(&mut queues, task)?;
        state.processed += 1;
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<FailOutcome> {
        let mut queues = self.shared.queues.lock().await;
        let (stored, state) = take_active(&mut queues, task)?;
        Ok(self.settle_failure(state, stored, error))
    }

    async fn requeue(&self, task: &Task) -> Result<()> {
        {
            let mut queues = self.shared.queues.lock().await;
            let (mut stored, state) = take_active(&mut queues, task)?;
            stored.status = TaskStatus::Pending;
            state.pending.push_front(stored);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;

        let now = Instant::now();
        let promoted = {
            let mut queues = self.shared.queues.lock().await;
            let Some(state) = queues.get_mut(queue) else {
                return Ok(0);
            };

            let (due, waiting): (Vec<_>, Vec<_>) =
                state.retry.drain(..).partition(|(at, _)| *at <= now);
            state.retry = waiting;

            let count = due.len();
            for (_, mut task) in due {
                task.status = TaskStatus::Pending;
                state.pending.push_back(task);
            }
            count
        };

        if promoted > 0 {
            self.shared.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn recover_expired(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut queues = self.shared.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, leased)| leased.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(leased) = state.active.remove(id) {
                let outcome = self.settle_failure(state, leased.task, LEASE_EXPIRED);
                tracing::warn!(task_id = %id, queue, ?outcome, "Recovered delivery with expired lease");
            }
        }
        Ok(expired.len())
    }

    async fn prune_dead(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;

        let mut queues = self.shared.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let before = state.dead.len();
        let retention = self.dead_retention;
        state.dead.retain(|(died_at, _)| died_at.elapsed() < retention);
        Ok(before - state.dead.len())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let queues = self.shared.queues.lock().await;
        let stats = queues
            .get(queue)
            .map(|s| QueueStats {
                queue: queue.to_string(),
                pending: s.pending.len() as u64,
                active: s.active.len() as u64,
                retry: s.retry.len() as u64,
                dead: s.dead.len() as u64,
                processed: s.processed,
                failed: s.failed,
            })
            .unwrap_or_else(|| QueueStats {
                queue: queue.to_string(),
                ..QueueStats::default()
            });
        Ok(stats)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let queues = self.shared.queues.lock().await;
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
