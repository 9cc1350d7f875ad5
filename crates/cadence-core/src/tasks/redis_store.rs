//! Redis-backed task store
//!
//! Layout:
//! - `tasks:task:{id}` hash: `msg` (task JSON), `state`, `score`, plus
//!   `started_at` / `completed_at` written by scripts that change state without
//!   rewriting `msg`
//! - `tasks:pending` sorted set scored `priority * 1e13 + created_ms`
//! - `tasks:scheduled` sorted set of retries scored by their not-before time (ms)
//! - `tasks:processing` set of running or retrying ids
//! - `tasks:completed` sorted set of finished ids scored by completion time (ms);
//!   finished task hashes also carry a TTL of the retention window
//! - `tasks:owner:{owner}` set of ids
//!
//! Every state change runs as one Lua script so concurrent workers on different
//! hosts can share the queue.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::store::{
    check_enqueue, expire_lease, lease_cutoff, lease_expired, QueueStats, TaskStore, DEFAULT_RETENTION,
};
use super::task::{Task, TaskStatus};
use crate::error::{CoreError, CoreResult};
use crate::redis_pool::RedisPool;

pub const TASK_KEY_PREFIX: &str = "tasks:task:";
pub const PENDING_KEY: &str = "tasks:pending";
pub const SCHEDULED_KEY: &str = "tasks:scheduled";
pub const PROCESSING_KEY: &str = "tasks:processing";
pub const COMPLETED_KEY: &str = "tasks:completed";
pub const OWNER_KEY_PREFIX: &str = "tasks:owner:";

/// Weight of the priority in the pending score; larger than any millisecond timestamp
const PRIORITY_WEIGHT: f64 = 1e13;

/// How often a blocking dequeue polls the server
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// KEYS[1] -> tasks:task:{id}
/// KEYS[2] -> tasks:pending
/// KEYS[3] -> tasks:scheduled
/// KEYS[4] -> tasks:owner:{owner} (optional)
/// ARGV[1] -> id
/// ARGV[2] -> task JSON
/// ARGV[3] -> pending score
/// ARGV[4] -> not-before ms, empty when ready now
///
/// Returns 1 when enqueued, 0 when the id already exists.
const ENQUEUE: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "pending", "score", ARGV[3])
    if ARGV[4] ~= "" then
        redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
    else
        redis.call("ZADD", KEYS[2], ARGV[3], ARGV[1])
    end
    if #KEYS >= 4 then
        redis.call("SADD", KEYS[4], ARGV[1])
    end
    return 1
"#;

/// KEYS[1] -> tasks:pending
/// KEYS[2] -> tasks:scheduled
/// KEYS[3] -> tasks:processing
/// ARGV[1] -> now ms
/// ARGV[2] -> started_at timestamp
/// ARGV[3] -> task key prefix
///
/// Moves due retries into the pending set, then pops the lowest score whose
/// task is still pending. Returns `{id, msg}` or nil.
const DEQUEUE: &str = r#"
    local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
    for _, id in ipairs(due) do
        redis.call("ZREM", KEYS[2], id)
        local key = ARGV[3] .. id
        if redis.call("HGET", key, "state") == "pending" then
            redis.call("ZADD", KEYS[1], redis.call("HGET", key, "score"), id)
        end
    end

    while true do
        local popped = redis.call("ZPOPMIN", KEYS[1])
        if #popped == 0 then
            return nil
        end
        local id = popped[1]
        local key = ARGV[3] .. id
        if redis.call("HGET", key, "state") == "pending" then
            redis.call("HSET", key, "state", "running", "started_at", ARGV[2])
            redis.call("SADD", KEYS[3], id)
            return {id, redis.call("HGET", key, "msg")}
        end
    end
"#;

/// KEYS[1] -> tasks:task:{id}
/// KEYS[2] -> tasks:pending
/// KEYS[3] -> tasks:scheduled
/// KEYS[4] -> tasks:processing
/// KEYS[5] -> tasks:completed
/// ARGV[1] -> id
/// ARGV[2] -> task JSON
/// ARGV[3] -> state
/// ARGV[4] -> pending score
/// ARGV[5] -> not-before ms, empty when ready now
/// ARGV[6] -> completion ms
/// ARGV[7] -> retention seconds
/// ARGV[8] -> state the task must currently be in, empty for any
///
/// Returns 1 on success, 0 when the task is already finished in another
/// state or not in the expected state, -1 when it does not exist.
const UPDATE: &str = r#"
    local current = redis.call("HGET", KEYS[1], "state")
    if not current then
        return -1
    end
    if ARGV[8] ~= "" and current ~= ARGV[8] then
        return 0
    end
    local terminal = {completed = true, failed = true, cancelled = true}
    if terminal[current] and current ~= ARGV[3] then
        return 0
    end

    redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", ARGV[3], "score", ARGV[4])
    redis.call("HDEL", KEYS[1], "started_at", "completed_at")
    redis.call("ZREM", KEYS[2], ARGV[1])
    redis.call("ZREM", KEYS[3], ARGV[1])
    redis.call("SREM", KEYS[4], ARGV[1])

    if ARGV[3] == "pending" then
        if ARGV[5] ~= "" then
            redis.call("ZADD", KEYS[3], ARGV[5], ARGV[1])
        else
            redis.call("ZADD", KEYS[2], ARGV[4], ARGV[1])
        end
    elseif terminal[ARGV[3]] then
        redis.call("ZADD", KEYS[5], ARGV[6], ARGV[1])
        redis.call("EXPIRE", KEYS[1], ARGV[7])
    else
        redis.call("SADD", KEYS[4], ARGV[1])
    end
    return 1
"#;

/// KEYS[1] -> tasks:task:{id}
/// KEYS[2] -> tasks:pending
/// KEYS[3] -> tasks:scheduled
/// KEYS[4] -> tasks:processing
/// KEYS[5] -> tasks:completed
/// ARGV[1] -> id
/// ARGV[2] -> completion ms
/// ARGV[3] -> completed_at timestamp
/// ARGV[4] -> retention seconds
///
/// Pending tasks, queued or scheduled for a retry, and retrying tasks can be
/// cancelled. Returns 1 when cancelled, 0 when running or finished, -1 when missing.
const CANCEL: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state then
        return -1
    end
    if state ~= "pending" and state ~= "retrying" then
        return 0
    end
    redis.call("HSET", KEYS[1], "state", "cancelled", "completed_at", ARGV[3])
    redis.call("ZREM", KEYS[2], ARGV[1])
    redis.call("ZREM", KEYS[3], ARGV[1])
    redis.call("SREM", KEYS[4], ARGV[1])
    redis.call("ZADD", KEYS[5], ARGV[2], ARGV[1])
    redis.call("EXPIRE", KEYS[1], ARGV[4])
    return 1
"#;

/// Task store shared between instances through Redis
pub struct RedisTaskStore {
    pool: RedisPool,
    retention: Duration,
    enqueue_script: Script,
    dequeue_script: Script,
    update_script: Script,
    cancel_script: Script,
}

impl RedisTaskStore {
    pub fn new(pool: RedisPool) -> Self {
        Self::with_retention(pool, DEFAULT_RETENTION)
    }

    /// Create a store keeping finished tasks for `retention`
    pub fn with_retention(pool: RedisPool, retention: Duration) -> Self {
        Self {
            pool,
            retention,
            enqueue_script: Script::new(ENQUEUE),
            dequeue_script: Script::new(DEQUEUE),
            update_script: Script::new(UPDATE),
            cancel_script: Script::new(CANCEL),
        }
    }

    fn task_key(id: &str) -> String {
        format!("{}{}", TASK_KEY_PREFIX, id)
    }

    fn owner_key(owner_id: &str) -> String {
        format!("{}{}", OWNER_KEY_PREFIX, owner_id)
    }

    fn retention_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }

    async fn try_dequeue(&self) -> CoreResult<Option<Task>> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let started_at = format_time(now);

        let popped: Option<(String, String)> = self
            .dequeue_script
            .key(PENDING_KEY)
            .key(SCHEDULED_KEY)
            .key(PROCESSING_KEY)
            .arg(now.timestamp_millis())
            .arg(&started_at)
            .arg(TASK_KEY_PREFIX)
            .invoke_async(&mut *conn)
            .await?;

        let Some((id, msg)) = popped else {
            return Ok(None);
        };

        let mut fields = HashMap::new();
        fields.insert("msg".to_string(), msg);
        fields.insert("state".to_string(), TaskStatus::Running.as_str().to_string());
        fields.insert("started_at".to_string(), started_at);

        debug!(task_id = %id, "Dequeued task");
        decode(&fields).map(Some)
    }

    /// Run the update script; with `expected` set the write only applies while
    /// the task is still in that state
    async fn write(&self, task: &Task, expected: Option<TaskStatus>) -> CoreResult<()> {
        task.validate()?;

        let now = Utc::now();
        let not_before = match task.not_before {
            Some(at) if task.status == TaskStatus::Pending && at > now => at.timestamp_millis().to_string(),
            _ => String::new(),
        };
        let completed_ms = task.completed_at.unwrap_or(now).timestamp_millis();

        let mut conn = self.pool.get().await?;
        let outcome: i64 = self
            .update_script
            .key(Self::task_key(&task.id))
            .key(PENDING_KEY)
            .key(SCHEDULED_KEY)
            .key(PROCESSING_KEY)
            .key(COMPLETED_KEY)
            .arg(&task.id)
            .arg(task.to_json()?)
            .arg(task.status.as_str())
            .arg(pending_score(task))
            .arg(not_before)
            .arg(completed_ms)
            .arg(self.retention_secs())
            .arg(expected.map(TaskStatus::as_str).unwrap_or(""))
            .invoke_async(&mut *conn)
            .await?;

        match outcome {
            1 => Ok(()),
            0 => Err(CoreError::Conflict(format!(
                "task {} is no longer in a state that can become {}",
                task.id, task.status
            ))),
            _ => Err(CoreError::NotFound(format!("task {}", task.id))),
        }
    }
}

/// Pending score: priority first, then creation time
pub fn pending_score(task: &Task) -> f64 {
    f64::from(task.priority.value()) * PRIORITY_WEIGHT + task.created_at.timestamp_millis() as f64
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| CoreError::Serialization(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Rebuild a task from its hash fields
fn decode(fields: &HashMap<String, String>) -> CoreResult<Task> {
    let msg = fields
        .get("msg")
        .ok_or_else(|| CoreError::Serialization("task hash has no msg field".to_string()))?;
    let mut task = Task::from_json(msg)?;

    if let Some(state) = fields.get("state") {
        task.status = state.parse::<TaskStatus>().map_err(CoreError::Serialization)?;
    }
    if let Some(raw) = fields.get("started_at") {
        task.started_at = Some(parse_time(raw)?);
    }
    if let Some(raw) = fields.get("completed_at") {
        task.completed_at = Some(parse_time(raw)?);
    }
    if task.status != TaskStatus::Pending {
        task.not_before = None;
    }

    Ok(task)
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn enqueue(&self, task: Task) -> CoreResult<String> {
        check_enqueue(&task)?;

        let now = Utc::now();
        let not_before = match task.not_before {
            Some(at) if at > now => at.timestamp_millis().to_string(),
            _ => String::new(),
        };

        let mut invocation = self.enqueue_script.key(Self::task_key(&task.id));
        invocation.key(PENDING_KEY).key(SCHEDULED_KEY);
        if let Some(owner) = &task.owner_id {
            invocation.key(Self::owner_key(owner));
        }
        invocation
            .arg(&task.id)
            .arg(task.to_json()?)
            .arg(pending_score(&task))
            .arg(not_before);

        let mut conn = self.pool.get().await?;
        let created: i64 = invocation.invoke_async(&mut *conn).await?;
        if created == 0 {
            return Err(CoreError::Conflict(format!("task {} already exists", task.id)));
        }

        debug!(task_id = %task.id, "Enqueued task");
        Ok(task.id)
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> CoreResult<Option<Task>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(task) = self.try_dequeue().await? {
                return Ok(Some(task));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            time::sleep_until(deadline.min(now + POLL_INTERVAL)).await;
        }
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Task>> {
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::task_key(id))
            .query_async(&mut *conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode(&fields).map(Some)
    }

    async fn update(&self, task: &Task) -> CoreResult<()> {
        self.write(task, None).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Task>> {
        let owner_key = Self::owner_key(owner_id);
        let ids: Vec<String> = {
            let mut conn = self.pool.get().await?;
            redis::cmd("SMEMBERS").arg(&owner_key).query_async(&mut *conn).await?
        };

        let mut tasks = Vec::with_capacity(ids.len());
        let mut expired = Vec::new();
        for id in ids {
            match self.get(&id).await? {
                Some(task) => tasks.push(task),
                None => expired.push(id),
            }
        }

        if !expired.is_empty() {
            let mut conn = self.pool.get().await?;
            redis::cmd("SREM")
                .arg(&owner_key)
                .arg(&expired)
                .query_async::<_, ()>(&mut *conn)
                .await?;
        }

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn cancel(&self, id: &str) -> CoreResult<bool> {
        let now = Utc::now();

        let mut conn = self.pool.get().await?;
        let outcome: i64 = self
            .cancel_script
            .key(Self::task_key(id))
            .key(PENDING_KEY)
            .key(SCHEDULED_KEY)
            .key(PROCESSING_KEY)
            .key(COMPLETED_KEY)
            .arg(id)
            .arg(now.timestamp_millis())
            .arg(format_time(now))
            .arg(self.retention_secs())
            .invoke_async(&mut *conn)
            .await?;

        match outcome {
            1 => {
                info!(task_id = %id, "Cancelled task");
                Ok(true)
            }
            0 => Ok(false),
            _ => Err(CoreError::NotFound(format!("task {}", id))),
        }
    }

    async fn recover_stale(&self, lease: Duration) -> CoreResult<usize> {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, lease)?;

        let ids: Vec<String> = {
            let mut conn = self.pool.get().await?;
            redis::cmd("SMEMBERS").arg(PROCESSING_KEY).query_async(&mut *conn).await?
        };

        let mut recovered = 0;
        for id in ids {
            let Some(mut task) = self.get(&id).await? else {
                let mut conn = self.pool.get().await?;
                redis::cmd("SREM")
                    .arg(PROCESSING_KEY)
                    .arg(&id)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                continue;
            };
            if !lease_expired(&task, cutoff) {
                continue;
            }

            let held = task.status;
            expire_lease(&mut task, now);
            match self.write(&task, Some(held)).await {
                Ok(()) => {
                    warn!(task_id = %id, status = %task.status, "Recovered task with an expired lease");
                    recovered += 1;
                }
                // Its worker wrote back in the meantime
                Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    async fn purge_expired(&self) -> CoreResult<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| CoreError::Configuration(format!("Invalid retention: {}", e)))?;
        let cutoff = (Utc::now() - retention).timestamp_millis();

        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(COMPLETED_KEY)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut *conn)
            .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(Self::task_key(id)).ignore();
        }
        pipe.zrem(COMPLETED_KEY, &ids).ignore();
        pipe.query_async::<_, ()>(&mut *conn).await?;

        Ok(ids.len())
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        let mut conn = self.pool.get().await?;
        let (pending, scheduled, running, finished): (usize, usize, usize, usize) = redis::pipe()
            .zcard(PENDING_KEY)
            .zcard(SCHEDULED_KEY)
            .scard(PROCESSING_KEY)
            .zcard(COMPLETED_KEY)
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStats {
            pending,
            scheduled,
            running,
            finished,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn health_check(&self) -> CoreResult<bool> {
        self.pool.ping().await
    }
}
