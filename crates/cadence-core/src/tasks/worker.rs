//! Task worker
//!
//! A worker repeatedly takes the next ready task from the store, runs its
//! handler and writes every state change back before looking for more work.
//! Failed attempts are not slept on: the task goes back to the store as PENDING
//! with a `not_before` time, and the worker moves on.
//!
//! Write-backs that hit an unavailable store are retried a few times. If the
//! store stays down the task is left RUNNING and the store's lease recovery
//! (see [`TaskStore::recover_stale`]) puts it back in play later.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::registry::{HandlerRegistry, TaskContext};
use super::store::TaskStore;
use super::task::{Task, TaskStatus, LAST_ERROR_KEY};
use crate::error::{CoreError, CoreResult};

/// Attempts at each state write before the worker gives up on it
const WRITE_ATTEMPTS: u32 = 3;

/// Delay after the first failed write; doubles for each further attempt
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Worker timing
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Longest wait on an empty queue before the shutdown flag is checked again
    pub poll_interval: Duration,
    /// Delay before the first retry; doubles with every further retry
    pub base_backoff: Duration,
    /// Upper bound for the retry delay
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Delay before the retry numbered `retry_count` (1 for the first retry)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Runs tasks from a [`TaskStore`] using handlers from a [`HandlerRegistry`]
pub struct TaskWorker {
    id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            registry,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Work until `shutdown` turns true. A task already started is finished first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "Task worker started");

        while !*shutdown.borrow() {
            if let Err(e) = self.process_next(Some(self.config.poll_interval)).await {
                error!(worker = %self.id, "Task worker error: {}", e);
                time::sleep(self.config.poll_interval).await;
            }
        }

        info!(worker = %self.id, "Task worker stopped");
    }

    /// Take one task, waiting up to `timeout`, and run it.
    ///
    /// Returns the task as last written back, or `None` when no task was ready.
    pub async fn process_next(&self, timeout: Option<Duration>) -> CoreResult<Option<Task>> {
        match self.store.dequeue(timeout).await? {
            Some(task) => self.execute(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a task the caller has already dequeued
    pub async fn execute(&self, mut task: Task) -> CoreResult<Task> {
        let Some(handler) = self.registry.get(&task.name) else {
            error!(worker = %self.id, task_id = %task.id, "No handler registered for task '{}'", task.name);
            task.status = TaskStatus::Failed;
            task.error = Some(format!("No handler registered for task '{}'", task.name));
            task.completed_at = Some(Utc::now());
            self.write_back(&task).await?;
            return Ok(task);
        };

        let ctx = TaskContext {
            task_id: task.id.clone(),
            name: task.name.clone(),
            attempt: task.retry_count + 1,
            owner_id: task.owner_id.clone(),
        };

        debug!(worker = %self.id, task_id = %task.id, attempt = ctx.attempt, "Running task '{}'", task.name);

        let outcome = AssertUnwindSafe(handler.handle(&ctx, &task.args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                task.status = TaskStatus::Completed;
                task.result = Some(value);
                task.error = None;
                task.completed_at = Some(Utc::now());
                self.write_back(&task).await?;
                info!(worker = %self.id, task_id = %task.id, "Task '{}' completed", task.name);
                Ok(task)
            }
            Ok(Err(e)) => {
                let retryable = e.is_retryable();
                self.handle_failure(task, e.to_string(), retryable).await
            }
            Err(panic) => {
                let message = format!("handler panicked: {}", panic_message(&*panic));
                self.handle_failure(task, message, true).await
            }
        }
    }

    async fn handle_failure(&self, mut task: Task, message: String, retryable: bool) -> CoreResult<Task> {
        if !retryable || !task.can_retry() {
            error!(
                worker = %self.id,
                task_id = %task.id,
                retries = task.retry_count,
                "Task '{}' failed: {}",
                task.name,
                message
            );
            task.status = TaskStatus::Failed;
            task.error = Some(message);
            task.completed_at = Some(Utc::now());
            self.write_back(&task).await?;
            return Ok(task);
        }

        // `error` stays empty until the task has really failed
        task.retry_count += 1;
        task.status = TaskStatus::Retrying;
        task.error = None;
        task.metadata.insert(LAST_ERROR_KEY.to_string(), message.clone().into());
        self.write_back(&task).await?;

        let delay = self.config.backoff(task.retry_count);
        warn!(
            worker = %self.id,
            task_id = %task.id,
            retry = task.retry_count,
            max_retries = task.max_retries,
            "Task '{}' failed, retrying in {:?}: {}",
            task.name,
            delay,
            message
        );

        task.status = TaskStatus::Pending;
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        task.not_before = Some(Utc::now() + delay);
        match self.write_back(&task).await {
            Ok(()) => Ok(task),
            Err(CoreError::Conflict(_)) => {
                // Cancelled while waiting to be re-queued
                info!(worker = %self.id, task_id = %task.id, "Task '{}' cancelled before retry", task.name);
                Ok(self.store.get(&task.id).await?.unwrap_or(task))
            }
            Err(e) => Err(e),
        }
    }

    /// Persist a state change, retrying while the store is unavailable
    async fn write_back(&self, task: &Task) -> CoreResult<()> {
        let mut attempt = 1;
        loop {
            match self.store.update(task).await {
                Err(e) if e.is_store_unavailable() && attempt < WRITE_ATTEMPTS => {
                    let delay = WRITE_RETRY_DELAY.saturating_mul(1 << (attempt - 1));
                    warn!(
                        worker = %self.id,
                        task_id = %task.id,
                        attempt,
                        "Writing task state {} failed, retrying in {:?}: {}",
                        task.status,
                        delay,
                        e
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_store_unavailable() {
                        error!(
                            worker = %self.id,
                            task_id = %task.id,
                            "Giving up writing task state {}: {}",
                            task.status,
                            e
                        );
                    }
                    return Err(e);
                }
                Ok(()) => return Ok(()),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn `count` workers sharing one store and registry
pub fn spawn_workers(
    count: usize,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!("Starting {} task workers on {} store", count, store.backend());

    (0..count)
        .map(|i| {
            let worker = TaskWorker::new(
                format!("worker-{}", i),
                Arc::clone(&store),
                Arc::clone(&registry),
                config.clone(),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}
