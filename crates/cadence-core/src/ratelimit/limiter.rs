//! Rate limiter: token bucket admission on top of a [`BucketStore`]

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::policy::RateLimitPolicy;
use super::store::BucketStore;
use crate::clock::{Clock, SystemClock};
use crate::error::CoreResult;

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Whole tokens left in the bucket
    pub remaining: u32,

    /// Requests per window of the applied policy
    pub limit: u32,

    /// Window of the applied policy, in seconds
    pub window_secs: u64,

    /// Unix time (seconds) when the bucket is full again (allowed) or when the
    /// next token becomes available (rejected)
    pub reset_at: f64,

    /// Time the decision was taken at
    pub now: f64,

    /// True when the store failed and the request was let through anyway
    pub degraded: bool,
}

impl Admission {
    /// Seconds a rejected client should wait, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        ((self.reset_at - self.now).ceil() as u64).max(1)
    }

    /// Reset time as whole Unix seconds
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.ceil() as u64
    }
}

/// Token bucket rate limiter
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter over `store` using the system clock
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock
    pub fn with_clock(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>) -> Self {
        info!("Creating rate limiter with {} bucket store", store.backend());
        Self { store, clock }
    }

    /// The bucket store in use
    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Decide whether a request for `key` is admitted under `policy`.
    ///
    /// Never fails: when the store cannot be reached the request is admitted and
    /// the decision is marked `degraded`.
    pub async fn admit(&self, key: &str, policy: &RateLimitPolicy) -> Admission {
        let now = self.clock.now();

        let outcome = match self.store.consume(key, policy, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %key, "Rate limit store error, allowing request: {}", e);
                return Admission {
                    allowed: true,
                    remaining: policy.requests,
                    limit: policy.requests,
                    window_secs: policy.window_secs,
                    reset_at: now,
                    now,
                    degraded: true,
                };
            }
        };

        let (remaining, reset_at) = if outcome.allowed {
            (
                outcome.tokens.max(0.0).floor() as u32,
                outcome.now + policy.seconds_until(outcome.tokens, policy.capacity()),
            )
        } else {
            debug!(key = %key, tokens = outcome.tokens, "Rate limit exceeded");
            (0, outcome.now + policy.seconds_until(outcome.tokens, 1.0))
        };

        Admission {
            allowed: outcome.allowed,
            remaining,
            limit: policy.requests,
            window_secs: policy.window_secs,
            reset_at,
            now: outcome.now,
            degraded: false,
        }
    }

    /// Remove buckets idle for longer than `horizon`
    pub async fn sweep(&self, horizon: Duration) -> CoreResult<usize> {
        let cutoff = self.clock.now() - horizon.as_secs_f64();
        self.store.sweep(cutoff).await
    }

    /// Spawn a background task that sweeps idle buckets every `interval`
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, horizon: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match limiter.sweep(horizon).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Rate limit maintenance removed {} idle buckets", removed),
                    Err(e) => warn!("Rate limit maintenance failed: {}", e),
                }
            }
        })
    }
}
