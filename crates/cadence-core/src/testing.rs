//! Store fakes that simulate an unreachable backend
//!
//! Used to check that admission fails open, that callers of the task store
//! surface outages instead of hiding them, and that workers ride out a store
//! that drops a few writes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::ratelimit::{BucketOutcome, BucketStore, RateLimitPolicy};
use crate::tasks::{InMemoryTaskStore, QueueStats, Task, TaskStore};

fn unavailable() -> CoreError {
    CoreError::StoreUnavailable("simulated outage".to_string())
}

/// Bucket store whose every call fails
#[derive(Debug, Default)]
pub struct FailingBucketStore {
    calls: AtomicUsize,
}

impl FailingBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `consume` calls seen
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BucketStore for FailingBucketStore {
    async fn consume(&self, _key: &str, _policy: &RateLimitPolicy, _now: f64) -> CoreResult<BucketOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(unavailable())
    }

    async fn sweep(&self, _cutoff: f64) -> CoreResult<usize> {
        Err(unavailable())
    }

    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn health_check(&self) -> CoreResult<bool> {
        Err(unavailable())
    }
}

/// Task store whose every call fails
#[derive(Debug, Default)]
pub struct FailingTaskStore;

#[async_trait]
impl TaskStore for FailingTaskStore {
    async fn enqueue(&self, _task: Task) -> CoreResult<String> {
        Err(unavailable())
    }

    async fn dequeue(&self, _timeout: Option<Duration>) -> CoreResult<Option<Task>> {
        Err(unavailable())
    }

    async fn get(&self, _id: &str) -> CoreResult<Option<Task>> {
        Err(unavailable())
    }

    async fn update(&self, _task: &Task) -> CoreResult<()> {
        Err(unavailable())
    }

    async fn list_by_owner(&self, _owner_id: &str) -> CoreResult<Vec<Task>> {
        Err(unavailable())
    }

    async fn cancel(&self, _id: &str) -> CoreResult<bool> {
        Err(unavailable())
    }

    async fn recover_stale(&self, _lease: Duration) -> CoreResult<usize> {
        Err(unavailable())
    }

    async fn purge_expired(&self) -> CoreResult<usize> {
        Err(unavailable())
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        Err(unavailable())
    }

    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn health_check(&self) -> CoreResult<bool> {
        Err(unavailable())
    }
}

/// In-memory task store whose next `update` calls fail
#[derive(Default)]
pub struct FlakyTaskStore {
    inner: InMemoryTaskStore,
    failing_updates: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FlakyTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` updates fail as if the store were down
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Number of `update` calls seen, failed ones included
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryTaskStore {
        &self.inner
    }
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn enqueue(&self, task: Task) -> CoreResult<String> {
        self.inner.enqueue(task).await
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> CoreResult<Option<Task>> {
        self.inner.dequeue(timeout).await
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Task>> {
        self.inner.get(id).await
    }

    async fn update(&self, task: &Task) -> CoreResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(unavailable());
        }
        self.inner.update(task).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Task>> {
        self.inner.list_by_owner(owner_id).await
    }

    async fn cancel(&self, id: &str) -> CoreResult<bool> {
        self.inner.cancel(id).await
    }

    async fn recover_stale(&self, lease: Duration) -> CoreResult<usize> {
        self.inner.recover_stale(lease).await
    }

    async fn purge_expired(&self) -> CoreResult<usize> {
        self.inner.purge_expired().await
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        self.inner.stats().await
    }

    fn backend(&self) -> &'static str {
        "flaky"
    }
}
