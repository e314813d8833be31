//! Redis-backed broker
//!
//! Layout per queue: a pending list of task ids, an active sorted set scored
//! by lease expiry, a retry sorted set scored by due time and a dead sorted
//! set scored by death time. Task records live under their own key,
//! msgpack-encoded.
//!
//! Every transition between those structures runs as one Lua script, so an
//! id is always in exactly one of them.

use super::{Broker, FailOutcome, QueueStats, DEFAULT_DEAD_RETENTION, DEFAULT_LEASE, LEASE_EXPIRED};
use crate::storage::keys::{queues_key, task_key, task_key_prefix};
use crate::storage::{QueueKeys, RedisClient, RedisConfig};
use crate::task::{Task, TaskInfo, TaskStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use fred::prelude::RedisValue;
use std::time::Duration;

/// Sleep between empty dequeue polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Most ids moved by one promotion or recovery pass
const SWEEP_BATCH: i64 = 100;

/// Lease bound that matches every active delivery
const ANY_LEASE: i64 = i64::MAX;

// KEYS: record, queues set, pending. ARGV: record bytes, id, queue
const ENQUEUE_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[3])
redis.call('RPUSH', KEYS[3], ARGV[2])
return 1
"#;

// KEYS: pending, active. ARGV: lease expiry (ms), task key prefix
// Returns nil when empty, {id} for an id without a record, {id, record} otherwise
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
    return nil
end
local record = redis.call('GET', ARGV[2] .. id)
if not record then
    return {id}
end
redis.call('ZADD', KEYS[2], ARGV[1], id)
return {id, record}
"#;

// KEYS: active, destination, stats, record
// ARGV: id, lease bound, mode (drop | front | scored), destination score,
//       new record ('' keeps it), record ttl seconds (0 = none), stats field ('' = none)
// Returns 1 if the delivery was still active under the bound, 0 otherwise
const SETTLE_SCRIPT: &str = r#"
local lease = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not lease or tonumber(lease) > tonumber(ARGV[2]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
if ARGV[3] == 'drop' then
    redis.call('DEL', KEYS[4])
elseif ARGV[3] == 'front' then
    redis.call('LPUSH', KEYS[2], ARGV[1])
else
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
end
local ttl = tonumber(ARGV[6])
if ARGV[5] ~= '' then
    if ttl > 0 then
        redis.call('SET', KEYS[4], ARGV[5], 'EX', ttl)
    else
        redis.call('SET', KEYS[4], ARGV[5])
    end
elseif ttl > 0 then
    redis.call('EXPIRE', KEYS[4], ttl)
end
if ARGV[7] ~= '' then
    redis.call('HINCRBY', KEYS[3], ARGV[7], 1)
end
return 1
"#;

// KEYS: active. ARGV: lease expiry (ms), ids...
const EXTEND_SCRIPT: &str = r#"
local extended = 0
for i = 2, #ARGV do
    if redis.call('ZSCORE', KEYS[1], ARGV[i]) then
        redis.call('ZADD', KEYS[1], ARGV[1], ARGV[i])
        extended = extended + 1
    end
end
return extended
"#;

// KEYS: retry, pending. ARGV: now (s), batch size
const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
return #ids
"#;

// KEYS: dead. ARGV: cutoff (s)
const PRUNE_SCRIPT: &str = r#"
return redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
"#;

/// Where a settled delivery goes
enum Destination<'a> {
    /// Record deleted
    Drop,
    /// Head of a list
    Front(&'a str),
    /// Sorted set with a score
    Scored(&'a str, i64),
}

/// One move out of the active set
struct Settle<'a> {
    keys: &'a QueueKeys,
    task_id: &'a str,
    lease_bound: i64,
    to: Destination<'a>,
    record: Option<Vec<u8>>,
    ttl: Option<Duration>,
    counter: Option<&'static str>,
}

/// Redis [`Broker`]
#[derive(Clone)]
pub struct RedisBroker {
    redis: RedisClient,
    lease: Duration,
    dead_retention: Duration,
    poll_interval: Duration,
}

impl RedisBroker {
    /// Wrap an existing client
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            lease: DEFAULT_LEASE,
            dead_retention: DEFAULT_DEAD_RETENTION,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Connect using a configuration and verify the connection
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let redis = RedisClient::new(config).await?;
        redis.ping().await?;
        tracing::info!(url = %config.url, "Connected to Redis");
        Ok(Self::new(redis))
    }

    /// Set the delivery lease
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set how long dead letters and their records are kept
    #[must_use]
    pub fn with_dead_retention(mut self, retention: Duration) -> Self {
        self.dead_retention = retention;
        self
    }

    /// Set the sleep between polls of an empty queue
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Get the underlying client
    pub fn client(&self) -> &RedisClient {
        &self.redis
    }

    fn lease_expiry(&self) -> i64 {
        Utc::now().timestamp_millis() + self.lease.as_millis() as i64
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>> {
        self.redis
            .get_bytes(&task_key(task_id))
            .await?
            .map(|record| decode_record(&record))
            .transpose()
    }

    /// Move a delivery out of the active set; false if it no longer matched
    async fn settle(&self, settle: Settle<'_>) -> Result<bool> {
        let (mode, destination, score) = match settle.to {
            Destination::Drop => ("drop", settle.keys.active.as_str(), 0),
            Destination::Front(key) => ("front", key, 0),
            Destination::Scored(key, score) => ("scored", key, score),
        };

        let record = match settle.record {
            Some(bytes) => RedisValue::Bytes(bytes.into()),
            None => RedisValue::from(""),
        };

        let moved = self
            .redis
            .eval(
                SETTLE_SCRIPT,
                vec![
                    settle.keys.active.clone(),
                    destination.to_string(),
                    settle.keys.stats.clone(),
                    task_key(settle.task_id),
                ],
                vec![
                    RedisValue::from(settle.task_id),
                    RedisValue::from(settle.lease_bound),
                    RedisValue::from(mode),
                    RedisValue::from(score),
                    record,
                    RedisValue::from(settle.ttl.map_or(0, |ttl| ttl.as_secs().max(1) as i64)),
                    RedisValue::from(settle.counter.unwrap_or("")),
                ],
            )
            .await?;

        Ok(moved.as_i64() == Some(1))
    }

    /// Apply a failure to an active delivery under `lease_bound`
    async fn settle_failure(
        &self,
        keys: &QueueKeys,
        task: &Task,
        error: &str,
        lease_bound: i64,
    ) -> Result<Option<FailOutcome>> {
        let mut task = task.clone();
        task.last_error = Some(error.to_string());

        let (outcome, to, ttl) = match task.retry_delay() {
            Some(delay) => {
                task.retry_cnt += 1;
                task.status = TaskStatus::Retry;
                let execute_at = Utc::now().timestamp() + delay.as_secs() as i64;
                let outcome = FailOutcome::Retry {
                    retry_cnt: task.retry_cnt,
                    execute_at,
                };
                (outcome, Destination::Scored(&keys.retry, execute_at), None)
            }
            None => {
                task.status = TaskStatus::Dead;
                let to = Destination::Scored(&keys.dead, Utc::now().timestamp());
                (FailOutcome::Dead, to, Some(self.dead_retention))
            }
        };

        let moved = self
            .settle(Settle {
                keys,
                task_id: &task.id,
                lease_bound,
                to,
                record: Some(encode_record(&task)?),
                ttl,
                counter: Some("failed"),
            })
            .await?;

        Ok(moved.then_some(outcome))
    }

    /// Dead-letter an active id whose record cannot be decoded
    async fn bury(&self, keys: &QueueKeys, task_id: &str) -> Result<()> {
        self.settle(Settle {
            keys,
            task_id,
            lease_bound: ANY_LEASE,
            to: Destination::Scored(&keys.dead, Utc::now().timestamp()),
            record: None,
            ttl: Some(self.dead_retention),
            counter: Some("failed"),
        })
        .await?;
        Ok(())
    }
}

fn encode_record(task: &Task) -> Result<Vec<u8>> {
    rmp_serde::to_vec(task).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_record(record: &[u8]) -> Result<Task> {
    rmp_serde::from_slice(record).map_err(|e| Error::Serialization(e.to_string()))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>, max_retry: u32) -> Result<TaskInfo> {
        let mut task = Task::new(queue, payload, max_retry);
        task.validate()?;
        task.enqueued_at = Some(Utc::now().timestamp());

        self.redis
            .eval(
                ENQUEUE_SCRIPT,
                vec![task_key(&task.id), queues_key(), QueueKeys::new(queue).pending],
                vec![
                    RedisValue::Bytes(encode_record(&task)?.into()),
                    RedisValue::from(task.id.as_str()),
                    RedisValue::from(queue),
                ],
            )
            .await?;

        tracing::debug!(task_id = %task.id, queue, "Task enqueued");
        Ok(task.info())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Task>> {
        let keys = QueueKeys::new(queue);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let popped = self
                .redis
                .eval(
                    DEQUEUE_SCRIPT,
                    vec![keys.pending.clone(), keys.active.clone()],
                    vec![
                        RedisValue::from(self.lease_expiry()),
                        RedisValue::from(task_key_prefix()),
                    ],
                )
                .await?;

            let parts = match popped {
                RedisValue::Array(parts) => parts,
                _ => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
                    continue;
                }
            };

            let mut parts = parts.into_iter();
            let Some(task_id) = parts.next().and_then(|id| id.as_string()) else {
                continue;
            };
            let Some(record) = parts.next() else {
                tracing::warn!(task_id = %task_id, queue, "Dropped task id without a record");
                continue;
            };

            let decoded = record
                .as_bytes()
                .ok_or_else(|| Error::Serialization("task record is not bytes".into()))
                .and_then(decode_record);

            return match decoded {
                Ok(mut task) => {
                    task.status = TaskStatus::Active;
                    task.processed_at = Some(Utc::now().timestamp());
                    Ok(Some(task))
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, queue, error = %e, "Dead-lettering undecodable task");
                    self.bury(&keys, &task_id).await?;
                    Err(e)
                }
            };
        }
    }

    fn lease(&self) -> Duration {
        self.lease
    }

    async fn extend_leases(&self, queue: &str, task_ids: &[String]) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }

        let mut args = Vec::with_capacity(task_ids.len() + 1);
        args.push(RedisValue::from(self.lease_expiry()));
        args.extend(task_ids.iter().map(|id| RedisValue::from(id.as_str())));

        self.redis
            .eval(EXTEND_SCRIPT, vec![QueueKeys::new(queue).active], args)
            .await?;
        Ok(())
    }

    async fn ack(&self, task: &Task) -> Result<()> {
        let keys = QueueKeys::new(&task.queue);
        let moved = self
            .settle(Settle {
                keys: &keys,
                task_id: &task.id,
                lease_bound: ANY_LEASE,
                to: Destination::Drop,
                record: None,
                ttl: None,
                counter: Some("processed"),
            })
            .await?;

        if moved {
            Ok(())
        } else {
            Err(Error::TaskNotFound(task.id.clone()))
        }
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<FailOutcome> {
        let keys = QueueKeys::new(&task.queue);
        let outcome = self
            .settle_failure(&keys, task, error, ANY_LEASE)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task.id.clone()))?;

        tracing::debug!(task_id = %task.id, ?outcome, "Task failed");
        Ok(outcome)
    }

    async fn requeue(&self, task: &Task) -> Result<()> {
        let keys = QueueKeys::new(&task.queue);
        let moved = self
            .settle(Settle {
                keys: &keys,
                task_id: &task.id,
                lease_bound: ANY_LEASE,
                to: Destination::Front(&keys.pending),
                record: None,
                ttl: None,
                counter: None,
            })
            .await?;

        if moved {
            Ok(())
        } else {
            Err(Error::TaskNotFound(task.id.clone()))
        }
    }

    async fn promote_due(&self, queue: &str) -> Result<usize> {
        let keys = QueueKeys::new(queue);
        let promoted = self
            .redis
            .eval(
                PROMOTE_SCRIPT,
                vec![keys.retry, keys.pending],
                vec![
                    RedisValue::from(Utc::now().timestamp()),
                    RedisValue::from(SWEEP_BATCH),
                ],
            )
            .await?;

        Ok(promoted.as_i64().unwrap_or(0) as usize)
    }

    async fn recover_expired(&self, queue: &str) -> Result<usize> {
        let keys = QueueKeys::new(queue);
        let now = Utc::now().timestamp_millis();
        let expired = self.redis.due(&keys.active, now).await?;

        let mut recovered = 0;
        for task_id in expired.iter().take(SWEEP_BATCH as usize) {
            let task = match self.load(task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    // Record gone; only the stale id is left to remove
                    self.settle(Settle {
                        keys: &keys,
                        task_id,
                        lease_bound: now,
                        to: Destination::Drop,
                        record: None,
                        ttl: None,
                        counter: None,
                    })
                    .await?;
                    continue;
                }
                Err(Error::Serialization(e)) => {
                    tracing::error!(task_id = %task_id, queue, error = %e, "Dead-lettering undecodable task");
                    self.bury(&keys, task_id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // A lease extended since the scan no longer matches the bound
            if let Some(outcome) = self.settle_failure(&keys, &task, LEASE_EXPIRED, now).await? {
                tracing::warn!(task_id = %task_id, queue, ?outcome, "Recovered delivery with expired lease");
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn prune_dead(&self, queue: &str) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.dead_retention.as_secs() as i64;
        let pruned = self
            .redis
            .eval(
                PRUNE_SCRIPT,
                vec![QueueKeys::new(queue).dead],
                vec![RedisValue::from(cutoff)],
            )
            .await?;

        Ok(pruned.as_i64().unwrap_or(0) as usize)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let keys = QueueKeys::new(queue);

        Ok(QueueStats {
            queue: queue.to_string(),
            pending: self.redis.list_len(&keys.pending).await?,
            active: self.redis.scheduled_len(&keys.active).await?,
            retry: self.redis.scheduled_len(&keys.retry).await?,
            dead: self.redis.scheduled_len(&keys.dead).await?,
            processed: self.redis.counter(&keys.stats, "processed").await?,
            failed: self.redis.counter(&keys.stats, "failed").await?,
        })
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let mut queues = self.redis.members(&queues_key()).await?;
        queues.sort();
        Ok(queues)
    }
}
