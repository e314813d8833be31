//! Redis key layout
//!
//! Everything lives under the `redisqueue:` namespace. Per-queue keys share a
//! `redisqueue:{queue}:` prefix so one queue can be inspected or removed with
//! a single `SCAN` pattern.

const NAMESPACE: &str = "redisqueue";

/// Keys owned by one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Task ids waiting for a worker slot (list)
    pub pending: String,
    /// Task ids handed to a worker, scored by lease expiry in ms (sorted set)
    pub active: String,
    /// Task ids waiting for their retry delay, scored by due time (sorted set)
    pub retry: String,
    /// Dead-lettered task ids, scored by death time (sorted set)
    pub dead: String,
    /// `processed` / `failed` counters (hash)
    pub stats: String,
}

impl QueueKeys {
    /// Build the key set of `queue`
    pub fn new(queue: &str) -> Self {
        let key = |kind: &str| format!("{NAMESPACE}:{queue}:{kind}");
        Self {
            pending: key("pending"),
            active: key("active"),
            retry: key("retry"),
            dead: key("dead"),
            stats: key("stats"),
        }
    }
}

/// Task record, msgpack-encoded
pub fn task_key(task_id: &str) -> String {
    format!("{}{task_id}", task_key_prefix())
}

/// Prefix of every task record key, for scripts that only know the id
pub fn task_key_prefix() -> String {
    format!("{NAMESPACE}:task:")
}

/// Set of every queue that has received a task
pub fn queues_key() -> String {
    format!("{NAMESPACE}:queues")
}
