//! Task stores
//!
//! The store owns the authoritative copy of every task. `dequeue` hands out the
//! best ready task and marks it RUNNING in the same step, so two callers can never
//! receive the same task. Tasks waiting out a retry backoff (`not_before` in the
//! future) are kept aside until they are due.
//!
//! A task whose worker died, or could not write its outcome, stays RUNNING until
//! [`TaskStore::recover_stale`] finds its lease (time since `started_at`) expired.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::task::{Priority, Task, TaskStatus, LAST_ERROR_KEY};
use crate::error::{CoreError, CoreResult};

/// How long terminal tasks stay readable by default
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a task may stay RUNNING before it is recovered, by default
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

/// Failure recorded on a task whose lease ran out
pub const LEASE_EXPIRED: &str = "worker lease expired";

/// Queue occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to run now
    pub pending: usize,
    /// Pending but waiting for a retry backoff to elapse
    pub scheduled: usize,
    pub running: usize,
    /// Completed, failed or cancelled and still retained
    pub finished: usize,
}

/// Storage and priority queue for tasks
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Add a new PENDING task; fails with `Conflict` if the id is taken
    async fn enqueue(&self, task: Task) -> CoreResult<String>;

    /// Take the highest priority ready task and mark it RUNNING.
    ///
    /// `None` polls once; `Some(timeout)` waits up to `timeout` for work. Running
    /// out of time is not an error and yields `Ok(None)`.
    async fn dequeue(&self, timeout: Option<Duration>) -> CoreResult<Option<Task>>;

    /// Fetch a task by id
    async fn get(&self, id: &str) -> CoreResult<Option<Task>>;

    /// Persist a new state for an existing task and re-index it
    async fn update(&self, task: &Task) -> CoreResult<()>;

    /// Tasks belonging to an owner, oldest first
    async fn list_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Task>>;

    /// Cancel a task that is PENDING (including one scheduled for a retry) or
    /// RETRYING; returns false if it is running or finished
    async fn cancel(&self, id: &str) -> CoreResult<bool>;

    /// Recover tasks left RUNNING or RETRYING for longer than `lease` since
    /// `started_at`. Each one is re-queued as a new attempt when it has retries
    /// left and fails otherwise. Returns how many were recovered.
    ///
    /// The lease must be longer than any handler runs, or a live task is run twice.
    async fn recover_stale(&self, lease: Duration) -> CoreResult<usize>;

    /// Drop terminal tasks older than the retention window; returns how many
    async fn purge_expired(&self) -> CoreResult<usize>;

    async fn stats(&self) -> CoreResult<QueueStats>;

    /// Name of the backend, for logs and health output
    fn backend(&self) -> &'static str;

    async fn health_check(&self) -> CoreResult<bool> {
        Ok(true)
    }
}

/// Spawn a background task that purges expired tasks every `interval`
pub fn spawn_purge_loop(store: Arc<dyn TaskStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => info!("Purged {} expired tasks", removed),
                Err(e) => warn!("Task purge failed: {}", e),
            }
        }
    })
}

/// Spawn a background task that recovers tasks with an expired lease every `interval`
pub fn spawn_recovery_loop(store: Arc<dyn TaskStore>, interval: Duration, lease: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.recover_stale(lease).await {
                Ok(0) => {}
                Ok(recovered) => warn!("Recovered {} tasks with an expired lease", recovered),
                Err(e) => warn!("Task lease recovery failed: {}", e),
            }
        }
    })
}

/// Whether a started task has held its lease since before `cutoff`
pub(crate) fn lease_expired(task: &Task, cutoff: DateTime<Utc>) -> bool {
    matches!(task.status, TaskStatus::Running | TaskStatus::Retrying)
        && task.started_at.map_or(false, |at| at <= cutoff)
}

/// Move a task whose lease expired back to PENDING, or to FAILED when out of retries.
///
/// A RETRYING task already counted its retry, so it is only re-queued.
pub(crate) fn expire_lease(task: &mut Task, now: DateTime<Utc>) {
    task.metadata.insert(LAST_ERROR_KEY.to_string(), LEASE_EXPIRED.into());
    task.not_before = None;

    if task.status == TaskStatus::Retrying {
        task.status = TaskStatus::Pending;
    } else if task.can_retry() {
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
    } else {
        task.status = TaskStatus::Failed;
        task.error = Some(LEASE_EXPIRED.to_string());
        task.completed_at = Some(now);
    }
}

pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> CoreResult<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| CoreError::Configuration(format!("Invalid lease: {}", e)))?;
    Ok(now - lease)
}

/// Rejects writes that would move a finished task back into the queue
pub(crate) fn check_transition(current: TaskStatus, next: TaskStatus, id: &str) -> CoreResult<()> {
    if current.is_terminal() && current != next {
        return Err(CoreError::Conflict(format!(
            "task {} is already {} and cannot become {}",
            id, current, next
        )));
    }
    Ok(())
}

pub(crate) fn check_enqueue(task: &Task) -> CoreResult<()> {
    task.validate()?;
    if task.status != TaskStatus::Pending {
        return Err(CoreError::Validation(format!(
            "only pending tasks can be enqueued, got {}",
            task.status
        )));
    }
    Ok(())
}

/// Heap entry; derived ordering gives (priority, created_at, seq)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
    id: String,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    ready: BinaryHeap<Reverse<ReadyEntry>>,
    /// Latest heap sequence per queued id; older heap entries are stale
    queued: HashMap<String, u64>,
    scheduled: BTreeSet<(DateTime<Utc>, String)>,
    next_seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, task: &Task) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queued.insert(task.id.clone(), seq);
        self.ready.push(Reverse(ReadyEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq,
            id: task.id.clone(),
        }));
    }

    fn unschedule(&mut self, task: &Task) {
        if let Some(at) = task.not_before {
            self.scheduled.remove(&(at, task.id.clone()));
        }
    }

    /// Place a task in the ready heap or the scheduled set according to its state
    fn index(&mut self, task: &Task, now: DateTime<Utc>) {
        self.queued.remove(&task.id);
        if task.status != TaskStatus::Pending {
            return;
        }
        match task.not_before {
            Some(at) if at > now => {
                self.scheduled.insert((at, task.id.clone()));
            }
            _ => self.push_ready(task),
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some((at, id)) = self.scheduled.first().cloned() {
            if at > now {
                break;
            }
            self.scheduled.remove(&(at, id.clone()));
            if let Some(task) = self.tasks.get(&id).cloned() {
                if task.status == TaskStatus::Pending {
                    self.push_ready(&task);
                }
            }
        }
    }

    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<Task> {
        self.promote_due(now);

        while let Some(Reverse(entry)) = self.ready.pop() {
            if self.queued.get(&entry.id) != Some(&entry.seq) {
                continue;
            }
            self.queued.remove(&entry.id);

            let Some(task) = self.tasks.get_mut(&entry.id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.not_before = None;
            return Some(task.clone());
        }

        None
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduled.first().map(|(at, _)| *at)
    }
}

/// Single-process task store
///
/// One mutex guards the task map, the ready heap and the scheduled set so the
/// pop-and-mark-running step is atomic. Blocked `dequeue` calls are woken through
/// a [`Notify`] whenever a task becomes ready.
pub struct InMemoryTaskStore {
    state: Mutex<QueueState>,
    notify: Notify,
    retention: Duration,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a store keeping terminal tasks for `retention`
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            retention,
        }
    }

    /// Number of tasks held, in any state
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    fn try_dequeue(&self) -> (Option<Task>, Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        let task = state.pop_ready(Utc::now());
        let next_due = state.next_due();
        (task, next_due)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: Task) -> CoreResult<String> {
        check_enqueue(&task)?;

        let id = task.id.clone();
        {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&id) {
                return Err(CoreError::Conflict(format!("task {} already exists", id)));
            }
            state.index(&task, Utc::now());
            state.tasks.insert(id.clone(), task);
        }

        debug!(task_id = %id, "Enqueued task");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> CoreResult<Option<Task>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let (task, next_due) = self.try_dequeue();
            if let Some(task) = task {
                debug!(task_id = %task.id, "Dequeued task");
                return Ok(Some(task));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake early when a scheduled retry falls due
            let mut wake_at = deadline;
            if let Some(due) = next_due {
                let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wake_at = wake_at.min(now + wait);
            }

            let _ = time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Task>> {
        Ok(self.state.lock().tasks.get(id).cloned())
    }

    async fn update(&self, task: &Task) -> CoreResult<()> {
        task.validate()?;

        let ready = {
            let mut state = self.state.lock();
            let Some(current) = state.tasks.get(&task.id).cloned() else {
                return Err(CoreError::NotFound(format!("task {}", task.id)));
            };
            check_transition(current.status, task.status, &task.id)?;

            state.unschedule(&current);
            state.index(task, Utc::now());
            state.tasks.insert(task.id.clone(), task.clone());
            state.queued.contains_key(&task.id)
        };

        if ready {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Task>> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn cancel(&self, id: &str) -> CoreResult<bool> {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get(id).cloned() else {
            return Err(CoreError::NotFound(format!("task {}", id)));
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
            return Ok(false);
        }

        state.unschedule(&task);
        state.queued.remove(id);
        if let Some(task) = state.tasks.get_mut(id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            task.not_before = None;
        }

        info!(task_id = %id, "Cancelled task");
        Ok(true)
    }

    async fn recover_stale(&self, lease: Duration) -> CoreResult<usize> {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, lease)?;

        let (recovered, requeued) = {
            let mut state = self.state.lock();
            let stale: Vec<String> = state
                .tasks
                .values()
                .filter(|t| lease_expired(t, cutoff))
                .map(|t| t.id.clone())
                .collect();

            let mut requeued = 0;
            for id in &stale {
                let Some(task) = state.tasks.get_mut(id) else {
                    continue;
                };
                expire_lease(task, now);
                let task = task.clone();
                state.index(&task, now);
                if task.status == TaskStatus::Pending {
                    requeued += 1;
                }
                warn!(task_id = %id, status = %task.status, "Recovered task with an expired lease");
            }
            (stale.len(), requeued)
        };

        for _ in 0..requeued {
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn purge_expired(&self) -> CoreResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| CoreError::Configuration(format!("Invalid retention: {}", e)))?;

        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.map_or(false, |at| at <= cutoff))
        });
        Ok(before - state.tasks.len())
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending if state.queued.contains_key(&task.id) => stats.pending += 1,
                TaskStatus::Pending => stats.scheduled += 1,
                TaskStatus::Running | TaskStatus::Retrying => stats.running += 1,
                _ => stats.finished += 1,
            }
        }
        Ok(stats)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
