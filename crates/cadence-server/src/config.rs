//! Configuration for the Cadence server
//!
//! Values come from an optional YAML file named by `CADENCE_CONFIG`, then from
//! environment variables, and are validated before anything starts.

use cadence_core::ratelimit::{PolicySet, RateLimitPolicy};
use cadence_core::tasks::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

/// Environment variable naming the YAML configuration file
pub const CONFIG_FILE_VAR: &str = "CADENCE_CONFIG";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Where buckets and tasks live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process stores, single instance only
    Local,
    /// Redis stores shared by every instance pointing at the same server
    Redis(String),
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Policy for paths without a more specific one
    #[serde(default)]
    pub default: RateLimitPolicy,

    /// Path pattern to policy; exact match first, then longest prefix
    #[serde(default = "default_route_policies")]
    pub policies: BTreeMap<String, RateLimitPolicy>,

    /// Paths that are never rate limited
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Idle time after which a bucket is dropped
    #[serde(default = "default_bucket_ttl_secs")]
    pub bucket_ttl_secs: u64,

    /// How often idle buckets are swept
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Task worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of worker loops; 0 runs the API without workers
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// How long a task may stay RUNNING before it is taken back from its worker
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Shared store connection string; unset selects the local stores
    #[serde(default)]
    pub shared_store_url: Option<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub worker: WorkerSettings,

    /// How long finished tasks stay readable
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_route_policies() -> BTreeMap<String, RateLimitPolicy> {
    let mut policies = BTreeMap::new();
    policies.insert("/v1/tasks".to_string(), RateLimitPolicy::new(30, 60).with_burst(5));
    policies
}

fn default_exempt_paths() -> Vec<String> {
    ["/", "/health", "/docs", "/openapi.json"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_bucket_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_lease_secs() -> u64 {
    3600
}

fn default_task_retention_secs() -> u64 {
    86_400 // 24 hours
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: RateLimitPolicy::default(),
            policies: default_route_policies(),
            exempt_paths: default_exempt_paths(),
            bucket_ttl_secs: default_bucket_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            shared_store_url: None,
            rate_limit: RateLimitConfig::default(),
            worker: WorkerSettings::default(),
            task_retention_secs: default_task_retention_secs(),
        }
    }
}

/// Parse `key` into `target`, keeping the current value when it does not parse
fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment and optional config file
    pub fn load() -> ServerResult<Self> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Load configuration reading variables through `lookup`
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let mut config = match lookup(CONFIG_FILE_VAR) {
            Some(path) => {
                info!("Reading configuration file {}", path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| ServerError::ConfigError(format!("Cannot read {}: {}", path, e)))?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env(&lookup);
        config.validate()?;

        info!("Loaded server configuration");
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(raw: &str) -> ServerResult<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_parsed(lookup, "SERVER_PORT", &mut self.port);

        if let Some(host) = lookup("SERVER_HOST") {
            self.bind_address = host;
        }

        if let Some(log_level) = lookup("LOG_LEVEL") {
            self.log_level = log_level;
        }
        override_parsed(lookup, "LOG_FORMAT", &mut self.log_format);

        if let Some(url) = lookup("SHARED_STORE_URL").or_else(|| lookup("REDIS_URL")) {
            self.shared_store_url = Some(url);
        }

        let rate_limit = &mut self.rate_limit;
        override_parsed(lookup, "RATE_LIMIT_REQUESTS", &mut rate_limit.default.requests);
        override_parsed(lookup, "RATE_LIMIT_WINDOW_SECS", &mut rate_limit.default.window_secs);
        override_parsed(lookup, "RATE_LIMIT_BURST", &mut rate_limit.default.burst);
        override_parsed(lookup, "RATE_LIMIT_BUCKET_TTL_SECS", &mut rate_limit.bucket_ttl_secs);
        override_parsed(lookup, "RATE_LIMIT_SWEEP_INTERVAL_SECS", &mut rate_limit.sweep_interval_secs);

        if let Some(paths) = lookup("RATE_LIMIT_EXEMPT_PATHS") {
            rate_limit.exempt_paths = paths
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        let worker = &mut self.worker;
        override_parsed(lookup, "WORKER_CONCURRENCY", &mut worker.concurrency);
        override_parsed(lookup, "WORKER_POLL_INTERVAL_MS", &mut worker.poll_interval_ms);
        override_parsed(lookup, "WORKER_BASE_BACKOFF_MS", &mut worker.base_backoff_ms);
        override_parsed(lookup, "WORKER_MAX_BACKOFF_SECS", &mut worker.max_backoff_secs);
        override_parsed(lookup, "WORKER_LEASE_SECS", &mut worker.lease_secs);

        override_parsed(lookup, "TASK_RETENTION_SECS", &mut self.task_retention_secs);
    }

    /// Reject configurations that would misbehave at request time
    pub fn validate(&self) -> ServerResult<()> {
        self.policy_set()?;
        self.store_backend()?;

        if self.rate_limit.bucket_ttl_secs == 0 {
            return Err(ServerError::ConfigError("Bucket TTL must be greater than 0".to_string()));
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            return Err(ServerError::ConfigError("Sweep interval must be greater than 0".to_string()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ServerError::ConfigError("Worker poll interval must be greater than 0".to_string()));
        }
        if self.worker.base_backoff_ms > self.worker.max_backoff_secs.saturating_mul(1000) {
            return Err(ServerError::ConfigError(
                "Worker base backoff must not exceed the maximum backoff".to_string(),
            ));
        }
        if self.worker.lease_secs == 0 {
            return Err(ServerError::ConfigError("Worker lease must be greater than 0".to_string()));
        }
        if self.task_retention_secs == 0 {
            return Err(ServerError::ConfigError("Task retention must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Validated rate limit policies
    pub fn policy_set(&self) -> ServerResult<PolicySet> {
        let rate_limit = &self.rate_limit;
        let mut policies = PolicySet::new(rate_limit.default);
        for (pattern, policy) in &rate_limit.policies {
            policies = policies.with_route(pattern.clone(), *policy);
        }
        for path in &rate_limit.exempt_paths {
            policies = policies.with_exempt(path.clone());
        }

        policies.validate()?;
        Ok(policies)
    }

    /// Backend selected by the shared store URL
    pub fn store_backend(&self) -> ServerResult<StoreBackend> {
        match self.shared_store_url.as_deref().map(str::trim) {
            None | Some("") => Ok(StoreBackend::Local),
            Some(url) if url.starts_with("memory://") => Ok(StoreBackend::Local),
            Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {
                Ok(StoreBackend::Redis(url.to_string()))
            }
            Some(url) => Err(ServerError::ConfigError(format!("Unsupported shared store URL: {}", url))),
        }
    }

    /// Timing for the task workers
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            base_backoff: Duration::from_millis(self.worker.base_backoff_ms),
            max_backoff: Duration::from_secs(self.worker.max_backoff_secs),
        }
    }

    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.rate_limit.bucket_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.sweep_interval_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn task_lease(&self) -> Duration {
        Duration::from_secs(self.worker.lease_secs)
    }
}
