//! Redis-backed bucket store
//!
//! The whole refill-and-consume step runs inside one Lua script, so instances
//! sharing the server can never both admit past the real capacity. Bucket hashes
//! live under `ratelimit:{key}` with fields `tokens` and `lastUpdateTime`, and their
//! TTL is refreshed on every call so idle buckets expire on their own.

use async_trait::async_trait;
use redis::Script;
use tracing::debug;

use super::bucket::BucketOutcome;
use super::policy::RateLimitPolicy;
use super::store::BucketStore;
use crate::error::{CoreError, CoreResult};
use crate::redis_pool::RedisPool;

/// Key prefix for bucket hashes
pub const BUCKET_KEY_PREFIX: &str = "ratelimit:";

/// Token bucket script
///
/// `KEYS[1]` -> ratelimit:{key}
/// `ARGV[1]` -> requests per window
/// `ARGV[2]` -> window seconds
/// `ARGV[3]` -> burst
/// `ARGV[4]` -> key TTL in milliseconds
///
/// Uses the server clock so instances with skewed clocks agree.
/// Returns `{allowed, tokens, now}`; floats travel as strings with 17
/// significant digits so they read back as the same double.
const TOKEN_BUCKET: &str = r#"
    local requests = tonumber(ARGV[1])
    local window = tonumber(ARGV[2])
    local capacity = requests + tonumber(ARGV[3])
    local ttl = tonumber(ARGV[4])

    local t = redis.call("TIME")
    local now = tonumber(t[1]) + tonumber(t[2]) / 1000000

    local state = redis.call("HMGET", KEYS[1], "tokens", "lastUpdateTime")
    local tokens = tonumber(state[1])
    local last = tonumber(state[2])
    local allowed = 0

    if tokens == nil or last == nil then
        tokens = capacity - 1
        allowed = 1
    else
        local elapsed = math.max(0, now - last)
        tokens = math.min(capacity, tokens + elapsed * requests / window)
        if tokens >= 1 then
            tokens = tokens - 1
            allowed = 1
        end
    end

    if allowed == 1 then
        redis.call("HSET", KEYS[1],
                   "tokens", string.format("%.17g", tokens),
                   "lastUpdateTime", string.format("%.17g", now))
    end
    redis.call("PEXPIRE", KEYS[1], ttl)

    return {allowed, string.format("%.17g", tokens), string.format("%.17g", now)}
"#;

/// Bucket store shared between instances through Redis
pub struct RedisBucketStore {
    pool: RedisPool,
    script: Script,
    key_ttl_ms: u64,
}

impl RedisBucketStore {
    /// Create a store; idle buckets expire after `key_ttl_ms`
    pub fn new(pool: RedisPool, key_ttl_ms: u64) -> Self {
        Self {
            pool,
            script: Script::new(TOKEN_BUCKET),
            key_ttl_ms: key_ttl_ms.max(1),
        }
    }

    fn make_key(key: &str) -> String {
        format!("{}{}", BUCKET_KEY_PREFIX, key)
    }
}

fn parse_f64(value: &str, field: &str) -> CoreResult<f64> {
    value
        .parse::<f64>()
        .map_err(|e| CoreError::Serialization(format!("Invalid bucket {} '{}': {}", field, value, e)))
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn consume(&self, key: &str, policy: &RateLimitPolicy, _now: f64) -> CoreResult<BucketOutcome> {
        let mut conn = self.pool.get().await?;

        let (allowed, tokens, now): (i64, String, String) = self
            .script
            .key(Self::make_key(key))
            .arg(policy.requests)
            .arg(policy.window_secs)
            .arg(policy.burst)
            .arg(self.key_ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens: parse_f64(&tokens, "tokens")?,
            now: parse_f64(&now, "timestamp")?,
        })
    }

    async fn sweep(&self, _cutoff: f64) -> CoreResult<usize> {
        // Keys carry their own TTL
        debug!("Redis bucket store relies on key expiry, nothing to sweep");
        Ok(0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn health_check(&self) -> CoreResult<bool> {
        self.pool.ping().await
    }
}
