//! Load a governor configuration file, apply environment overrides, validate
//! it and print the effective configuration as JSON.
//!
//! Usage: `governor-config [PATH]`. Without a path the built-in defaults are
//! checked. Exits non-zero when the configuration is invalid.

use ai_governor::config::GovernorConfig;
use ai_governor::logging::init_tracing;
use anyhow::Context;

fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let path = std::env::args().nth(1);
    let mut cfg = match &path {
        Some(p) => GovernorConfig::from_path(p).with_context(|| format!("failed to read {p}"))?,
        None => GovernorConfig::default(),
    };
    cfg.apply_env_overrides();

    let cfg = cfg
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.as_deref().unwrap_or("<defaults>")))?;

    println!("{}", serde_json::to_string_pretty(&cfg)?);
    eprintln!(
        "configuration OK: {} workers, queue {}, pool {}+{}, {}/min {}/h",
        cfg.queue.max_workers,
        cfg.queue.max_queue_size,
        cfg.pool.pool_size,
        cfg.pool.max_overflow,
        cfg.rate_limit.requests_per_minute,
        cfg.rate_limit.requests_per_hour,
    );
    Ok(())
}
