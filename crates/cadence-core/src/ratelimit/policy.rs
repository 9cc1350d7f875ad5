//! Rate limit policies and path-based policy lookup

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// Group name used for requests that fall through to the default policy
pub const DEFAULT_GROUP: &str = "default";

/// Token bucket policy
///
/// `requests` tokens refill evenly over `window_secs`; `burst` extra tokens of
/// headroom sit on top, so the bucket holds `requests + burst` at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub requests: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Additional burst capacity
    #[serde(default)]
    pub burst: u32,
}

impl RateLimitPolicy {
    /// Create a policy without burst headroom
    pub fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
            burst: 0,
        }
    }

    /// Set the burst headroom
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Maximum tokens the bucket can hold
    pub fn capacity(&self) -> f64 {
        f64::from(self.requests) + f64::from(self.burst)
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests) / self.window_secs as f64
    }

    /// Tokens regained after `elapsed` seconds.
    ///
    /// Multiplies before dividing so whole-token refills land exactly on 1.0.
    pub fn refill(&self, elapsed: f64) -> f64 {
        elapsed * f64::from(self.requests) / self.window_secs as f64
    }

    /// Seconds until `tokens` reaches `target` at the refill rate
    pub fn seconds_until(&self, tokens: f64, target: f64) -> f64 {
        if tokens >= target {
            return 0.0;
        }
        (target - tokens) * self.window_secs as f64 / f64::from(self.requests)
    }

    /// Reject policies that cannot refill
    pub fn validate(&self) -> CoreResult<()> {
        if self.requests == 0 {
            return Err(CoreError::InvalidPolicy(
                "requests per window must be greater than 0".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(CoreError::InvalidPolicy(
                "window must be greater than 0 seconds".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests: 60,
            window_secs: 60,
            burst: 10,
        }
    }
}

/// Policy matched for a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyMatch<'a> {
    /// Path group the request is accounted under
    pub group: &'a str,

    /// Policy to apply
    pub policy: &'a RateLimitPolicy,
}

/// Set of path policies with a guaranteed default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    default: RateLimitPolicy,
    routes: BTreeMap<String, RateLimitPolicy>,
    exempt: Vec<String>,
}

impl PolicySet {
    /// Create a policy set that applies `default` everywhere
    pub fn new(default: RateLimitPolicy) -> Self {
        Self {
            default,
            routes: BTreeMap::new(),
            exempt: Vec::new(),
        }
    }

    /// Add a policy for a path pattern
    pub fn with_route(mut self, pattern: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.routes.insert(pattern.into(), policy);
        self
    }

    /// Exempt a path (and everything below it) from rate limiting
    pub fn with_exempt(mut self, path: impl Into<String>) -> Self {
        self.exempt.push(path.into());
        self
    }

    /// Validate every policy in the set
    pub fn validate(&self) -> CoreResult<()> {
        self.default
            .validate()
            .map_err(|e| CoreError::InvalidPolicy(format!("default policy: {}", e)))?;

        for (pattern, policy) in &self.routes {
            if pattern.is_empty() {
                return Err(CoreError::InvalidPolicy("empty path pattern".to_string()));
            }
            policy
                .validate()
                .map_err(|e| CoreError::InvalidPolicy(format!("policy for '{}': {}", pattern, e)))?;
        }
        Ok(())
    }

    /// The default policy
    pub fn default_policy(&self) -> &RateLimitPolicy {
        &self.default
    }

    /// Configured route patterns
    pub fn routes(&self) -> impl Iterator<Item = (&String, &RateLimitPolicy)> {
        self.routes.iter()
    }

    /// Whether the path bypasses rate limiting
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|exempt| {
            if path == exempt {
                return true;
            }
            // "/" only exempts itself
            exempt != "/"
                && path
                    .strip_prefix(exempt.as_str())
                    .map_or(false, |rest| rest.starts_with('/'))
        })
    }

    /// Find the policy for a path: exact match, then longest prefix, then default
    pub fn lookup(&self, path: &str) -> PolicyMatch<'_> {
        if let Some((pattern, policy)) = self.routes.get_key_value(path) {
            return PolicyMatch {
                group: pattern,
                policy,
            };
        }

        self.routes
            .iter()
            .filter(|(pattern, _)| path.starts_with(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(pattern, policy)| PolicyMatch {
                group: pattern,
                policy,
            })
            .unwrap_or(PolicyMatch {
                group: DEFAULT_GROUP,
                policy: &self.default,
            })
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies() -> PolicySet {
        PolicySet::new(RateLimitPolicy::new(100, 60))
            .with_route("/api", RateLimitPolicy::new(50, 60))
            .with_route("/api/generate", RateLimitPolicy::new(10, 60).with_burst(2))
            .with_route("/api/generate/batch", RateLimitPolicy::new(2, 60))
            .with_exempt("/")
            .with_exempt("/health")
            .with_exempt("/docs")
    }

    #[test]
    fn test_exact_match_wins() {
        let set = policies();
        let found = set.lookup("/api/generate");
        assert_eq!(found.group, "/api/generate");
        assert_eq!(found.policy.requests, 10);
    }

    #[test]
    fn test_longest_prefix_match() {
        let set = policies();

        let found = set.lookup("/api/generate/batch/42");
        assert_eq!(found.group, "/api/generate/batch");

        let found = set.lookup("/api/generate/text");
        assert_eq!(found.group, "/api/generate");

        let found = set.lookup("/api/audit");
        assert_eq!(found.group, "/api");
    }

    #[test]
    fn test_default_policy_fallback() {
        let set = policies();
        let found = set.lookup("/other");
        assert_eq!(found.group, DEFAULT_GROUP);
        assert_eq!(found.policy.requests, 100);
    }

    #[test]
    fn test_exempt_paths() {
        let set = policies();
        assert!(set.is_exempt("/"));
        assert!(set.is_exempt("/health"));
        assert!(set.is_exempt("/docs/index.html"));
        assert!(!set.is_exempt("/healthz"));
        assert!(!set.is_exempt("/api/generate"));
    }

    #[test]
    fn test_capacity_and_refill() {
        let policy = RateLimitPolicy::new(10, 60).with_burst(2);
        assert_eq!(policy.capacity(), 12.0);
        assert!((policy.refill_rate() - 1.0 / 6.0).abs() < f64::EPSILON);
        assert_eq!(policy.refill(6.0), 1.0);
        assert_eq!(policy.seconds_until(0.0, 1.0), 6.0);
        assert_eq!(policy.seconds_until(2.0, 1.0), 0.0);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let set = PolicySet::new(RateLimitPolicy::new(10, 0));
        assert!(matches!(set.validate(), Err(CoreError::InvalidPolicy(_))));

        let set = PolicySet::new(RateLimitPolicy::new(10, 60))
            .with_route("/api", RateLimitPolicy::new(0, 60));
        assert!(matches!(set.validate(), Err(CoreError::InvalidPolicy(_))));

        assert!(policies().validate().is_ok());
    }

    #[test]
    fn test_policy_deserializes_without_burst() {
        let policy: RateLimitPolicy =
            serde_json::from_str(r#"{"requests": 5, "window_secs": 10}"#).unwrap();
        assert_eq!(policy, RateLimitPolicy::new(5, 10));
    }
}
