//! Loading governor configuration from files

use ai_governor::config::GovernorConfig;
use ai_governor::error_code::GovernorErrorCode;
use ai_governor::Error;
use std::path::PathBuf;
use std::time::Duration;

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ai-governor-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_yaml_file() {
    let path = write_temp(
        "governor.yaml",
        r#"
queue:
  max_workers: 6
  max_queue_size: 200
  task_timeout: 45
  result_ttl: 600
pool:
  pool_size: 4
  max_overflow: 8
breaker:
  name: ollama
  failure_threshold: 3
"#,
    );
    let cfg = GovernorConfig::load(&path).unwrap();
    assert_eq!(cfg.queue.task_timeout, Duration::from_secs(45));
    assert_eq!(cfg.queue.result_ttl, Duration::from_secs(600));
    assert_eq!(cfg.breaker.name, "ollama");
    // Untouched sections keep their defaults.
    assert_eq!(cfg.login.lockout_duration, Duration::from_secs(900));
}

#[test]
fn test_json_file_with_overrides() {
    let path = write_temp(
        "governor.json",
        r#"{"rate_limit": {"requests_per_minute": 10, "requests_per_hour": 100}}"#,
    );
    let mut cfg = GovernorConfig::from_path(&path).unwrap();
    assert_eq!(cfg.rate_limit.requests_per_minute, 10);

    cfg.apply_overrides_from(|key| match key {
        "RATE_LIMIT_PER_HOUR" => Some("250".into()),
        "LOGIN_LOCKOUT_SECS" => Some(" 60 ".into()),
        _ => None,
    });
    let cfg = cfg.validate().unwrap();
    assert_eq!(cfg.rate_limit.requests_per_minute, 10);
    assert_eq!(cfg.rate_limit.requests_per_hour, 250);
    assert_eq!(cfg.login.lockout_duration, Duration::from_secs(60));
}

#[test]
fn test_missing_file_is_io_error() {
    let path = std::env::temp_dir().join("ai-governor-does-not-exist.yaml");
    let err = GovernorConfig::from_path(&path).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let path = write_temp("broken.yml", "queue: [not, a, mapping");
    let err = GovernorConfig::from_path(&path).unwrap_err();
    assert!(matches!(err, Error::Yaml(_)));
    assert_eq!(err.code(), GovernorErrorCode::Parse);
}

#[test]
fn test_invalid_values_reported_with_field() {
    let path = write_temp(
        "zero.yaml",
        "rate_limit:\n  requests_per_minute: 0\n",
    );
    let cfg = GovernorConfig::from_path(&path).unwrap();
    let err = cfg.validate().unwrap_err();
    assert_eq!(err.code(), GovernorErrorCode::Configuration);
    assert!(err.to_string().contains("rate_limit.requests_per_minute"));
}

#[test]
fn test_effective_config_round_trips_through_json() {
    let cfg = GovernorConfig::default().validate().unwrap();
    let text = serde_json::to_string(&cfg).unwrap();
    let back = GovernorConfig::from_json_str(&text).unwrap();
    assert_eq!(back.queue.poll_interval, cfg.queue.poll_interval);
    assert_eq!(back.pool.max_lifetime, cfg.pool.max_lifetime);
    assert_eq!(back.breaker.recovery_timeout, cfg.breaker.recovery_timeout);
}
