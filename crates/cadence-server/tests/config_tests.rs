use std::collections::HashMap;
use std::path::PathBuf;

use cadence_server::config::{LogFormat, ServerConfig, StoreBackend, CONFIG_FILE_VAR};
use cadence_server::ServerError;

fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ServerError> {
    let env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ServerConfig::load_with(|key| env.get(key).cloned())
}

fn temp_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("cadence-{}-{}.yaml", name, std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_defaults() {
    let config = load(&[]).unwrap();

    assert_eq!(config.port, 8080);
    assert_eq!(config.bind_address, "0.0.0.0");
    assert_eq!(config.log_format, LogFormat::Pretty);
    assert_eq!(config.store_backend().unwrap(), StoreBackend::Local);
    assert_eq!(config.worker.concurrency, 2);
    assert_eq!(config.task_retention_secs, 86_400);
    assert_eq!(config.task_lease().as_secs(), 3600);

    let policies = config.policy_set().unwrap();
    assert_eq!(policies.default_policy().requests, 60);
    assert_eq!(policies.default_policy().burst, 10);
    let tasks = policies.lookup("/v1/tasks/abc");
    assert_eq!(tasks.group, "/v1/tasks");
    assert_eq!(tasks.policy.requests, 30);
    assert_eq!(tasks.policy.burst, 5);
    assert!(policies.is_exempt("/health"));
    assert!(policies.is_exempt("/"));
    assert!(!policies.is_exempt("/v1/tasks"));
}

#[test]
fn test_env_overrides() {
    let config = load(&[
        ("SERVER_PORT", "9090"),
        ("SERVER_HOST", "127.0.0.1"),
        ("LOG_FORMAT", "json"),
        ("RATE_LIMIT_REQUESTS", "100"),
        ("RATE_LIMIT_BURST", "0"),
        ("RATE_LIMIT_EXEMPT_PATHS", "/health, /metrics,"),
        ("WORKER_CONCURRENCY", "4"),
        ("WORKER_BASE_BACKOFF_MS", "250"),
        ("TASK_RETENTION_SECS", "60"),
        ("WORKER_LEASE_SECS", "900"),
    ])
    .unwrap();

    assert_eq!(config.port, 9090);
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.rate_limit.default.requests, 100);
    assert_eq!(config.rate_limit.default.burst, 0);
    assert_eq!(config.rate_limit.exempt_paths, vec!["/health", "/metrics"]);
    assert_eq!(config.worker.concurrency, 4);
    assert_eq!(config.worker_config().base_backoff.as_millis(), 250);
    assert_eq!(config.task_retention().as_secs(), 60);
    assert_eq!(config.task_lease().as_secs(), 900);
}

#[test]
fn test_invalid_numbers_keep_defaults() {
    let config = load(&[("SERVER_PORT", "eighty"), ("WORKER_CONCURRENCY", "-1")]).unwrap();
    assert_eq!(config.port, 8080);
    assert_eq!(config.worker.concurrency, 2);
}

#[test]
fn test_store_backend_selection() {
    let config = load(&[("REDIS_URL", "redis://cache:6379")]).unwrap();
    assert_eq!(
        config.store_backend().unwrap(),
        StoreBackend::Redis("redis://cache:6379".to_string())
    );

    let config = load(&[
        ("SHARED_STORE_URL", "rediss://primary:6380"),
        ("REDIS_URL", "redis://cache:6379"),
    ])
    .unwrap();
    assert_eq!(
        config.store_backend().unwrap(),
        StoreBackend::Redis("rediss://primary:6380".to_string())
    );

    let config = load(&[("SHARED_STORE_URL", "memory://")]).unwrap();
    assert_eq!(config.store_backend().unwrap(), StoreBackend::Local);

    let unsupported = load(&[("SHARED_STORE_URL", "postgres://db/cadence")]);
    assert!(matches!(unsupported, Err(ServerError::ConfigError(_))));
}

#[test]
fn test_invalid_configuration_fails_fast() {
    let zero_window = load(&[("RATE_LIMIT_WINDOW_SECS", "0")]);
    assert!(matches!(zero_window, Err(ServerError::ConfigError(_))));

    let zero_requests = load(&[("RATE_LIMIT_REQUESTS", "0")]);
    assert!(matches!(zero_requests, Err(ServerError::ConfigError(_))));

    let backoff = load(&[("WORKER_BASE_BACKOFF_MS", "120000"), ("WORKER_MAX_BACKOFF_SECS", "60")]);
    assert!(matches!(backoff, Err(ServerError::ConfigError(_))));

    let poll = load(&[("WORKER_POLL_INTERVAL_MS", "0")]);
    assert!(matches!(poll, Err(ServerError::ConfigError(_))));

    let lease = load(&[("WORKER_LEASE_SECS", "0")]);
    assert!(matches!(lease, Err(ServerError::ConfigError(_))));
}

#[test]
fn test_yaml_file_then_env() {
    let path = temp_config(
        "yaml",
        r#"
port: 7000
log_level: debug
rate_limit:
  default:
    requests: 10
    window_secs: 1
    burst: 0
  policies:
    /api/generate:
      requests: 5
      window_secs: 60
      burst: 2
  exempt_paths: ["/health"]
worker:
  concurrency: 8
"#,
    );

    let config = load(&[
        (CONFIG_FILE_VAR, path.to_str().unwrap()),
        ("SERVER_PORT", "7001"),
    ])
    .unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.port, 7001);
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.worker.concurrency, 8);
    assert_eq!(config.worker.poll_interval_ms, 1000);

    let policies = config.policy_set().unwrap();
    assert_eq!(policies.default_policy().window_secs, 1);
    let generate = policies.lookup("/api/generate/batch");
    assert_eq!(generate.group, "/api/generate");
    assert_eq!(generate.policy.burst, 2);
    // The file replaced the built-in route map and exempt list
    assert_eq!(policies.lookup("/v1/tasks").group, "default");
    assert!(!policies.is_exempt("/"));
}

#[test]
fn test_invalid_yaml_policy_is_rejected() {
    let path = temp_config(
        "bad-policy",
        r#"
rate_limit:
  policies:
    /api:
      requests: 5
      window_secs: 0
"#,
    );

    let result = load(&[(CONFIG_FILE_VAR, path.to_str().unwrap())]);
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(ServerError::ConfigError(_))));
}

#[test]
fn test_missing_config_file() {
    let result = load(&[(CONFIG_FILE_VAR, "/nonexistent/cadence.yaml")]);
    assert!(matches!(result, Err(ServerError::ConfigError(_))));
}
