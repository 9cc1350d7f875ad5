//! Request admission: token bucket policies, bucket stores and the limiter

pub mod bucket;
pub mod limiter;
pub mod policy;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use bucket::{BucketOutcome, BucketState};
pub use limiter::{Admission, RateLimiter};
pub use policy::{PolicyMatch, PolicySet, RateLimitPolicy, DEFAULT_GROUP};
pub use store::{BucketStore, LocalBucketStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisBucketStore;
