//! Cadence core
//!
//! Request admission through token buckets, and a priority task queue with
//! retrying workers. Both halves sit behind store traits with an in-process
//! implementation and, with the `redis` feature, a shared one.

pub mod clock;
pub mod error;
pub mod ratelimit;
pub mod tasks;

#[cfg(feature = "redis")]
pub mod redis_pool;

#[cfg(feature = "testing")]
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use ratelimit::{Admission, BucketStore, LocalBucketStore, PolicySet, RateLimitPolicy, RateLimiter};
pub use tasks::{
    HandlerError, HandlerRegistry, InMemoryTaskStore, Priority, Task, TaskArgs, TaskContext, TaskHandler,
    TaskStatus, TaskStore, TaskWorker, WorkerConfig,
};

#[cfg(feature = "redis")]
pub use redis_pool::{RedisPool, RedisPoolConfig};
#[cfg(feature = "redis")]
pub use ratelimit::RedisBucketStore;
#[cfg(feature = "redis")]
pub use tasks::RedisTaskStore;
