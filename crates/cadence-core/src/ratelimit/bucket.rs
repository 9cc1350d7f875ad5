//! Token bucket state and the refill/consume step shared by every backend

use serde::{Deserialize, Serialize};

use super::policy::RateLimitPolicy;

/// Per-key bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,

    /// Last time (Unix seconds) the bucket was written
    pub last_update: f64,
}

/// Raw result of a consume step as reported by a bucket store
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was consumed
    pub allowed: bool,

    /// Tokens left after the step
    pub tokens: f64,

    /// Time the step was evaluated at (the store's notion of now)
    pub now: f64,
}

/// Refill the bucket for the time elapsed since its last update and try to take
/// one token.
///
/// A missing bucket is created full and immediately charged for this request, so
/// the first request for a key is always admitted. Returns the state to persist
/// (`None` when nothing changed) together with the outcome.
pub fn take_token(
    state: Option<BucketState>,
    policy: &RateLimitPolicy,
    now: f64,
) -> (Option<BucketState>, BucketOutcome) {
    let capacity = policy.capacity();

    let Some(state) = state else {
        let tokens = capacity - 1.0;
        return (
            Some(BucketState {
                tokens,
                last_update: now,
            }),
            BucketOutcome {
                allowed: true,
                tokens,
                now,
            },
        );
    };

    // Clock skew between writers must never drain the bucket
    let elapsed = (now - state.last_update).max(0.0);
    let tokens = (state.tokens + policy.refill(elapsed)).min(capacity);

    if tokens >= 1.0 {
        let tokens = tokens - 1.0;
        (
            Some(BucketState {
                tokens,
                last_update: now,
            }),
            BucketOutcome {
                allowed: true,
                tokens,
                now,
            },
        )
    } else {
        (
            None,
            BucketOutcome {
                allowed: false,
                tokens,
                now,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_creates_bucket_minus_one() {
        let policy = RateLimitPolicy::new(10, 60);
        let (state, outcome) = take_token(None, &policy, 1000.0);

        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 9.0);
        assert_eq!(
            state,
            Some(BucketState {
                tokens: 9.0,
                last_update: 1000.0
            })
        );
    }

    #[test]
    fn test_empty_bucket_rejects_without_writing() {
        let policy = RateLimitPolicy::new(10, 60);
        let empty = BucketState {
            tokens: 0.0,
            last_update: 1000.0,
        };

        let (state, outcome) = take_token(Some(empty), &policy, 1003.0);
        assert!(!outcome.allowed);
        assert_eq!(outcome.tokens, 0.5);
        assert!(state.is_none());
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let policy = RateLimitPolicy::new(10, 60).with_burst(2);
        let state = BucketState {
            tokens: 0.0,
            last_update: 0.0,
        };

        let (state, outcome) = take_token(Some(state), &policy, 10_000.0);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 11.0);
        assert_eq!(state.map(|s| s.last_update), Some(10_000.0));
    }

    #[test]
    fn test_backwards_clock_does_not_drain() {
        let policy = RateLimitPolicy::new(10, 60);
        let state = BucketState {
            tokens: 5.0,
            last_update: 100.0,
        };

        let (_, outcome) = take_token(Some(state), &policy, 90.0);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 4.0);
    }
}
