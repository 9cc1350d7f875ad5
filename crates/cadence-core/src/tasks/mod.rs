//! Background task queue: task records, stores, handler registry and workers

pub mod registry;
pub mod store;
pub mod task;
pub mod worker;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use registry::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};
pub use store::{
    spawn_purge_loop, spawn_recovery_loop, InMemoryTaskStore, QueueStats, TaskStore, DEFAULT_LEASE, DEFAULT_RETENTION,
    LEASE_EXPIRED,
};
pub use task::{Priority, Task, TaskArgs, TaskStatus, DEFAULT_MAX_RETRIES, LAST_ERROR_KEY};
pub use worker::{spawn_workers, TaskWorker, WorkerConfig};

#[cfg(feature = "redis")]
pub use redis_store::RedisTaskStore;
