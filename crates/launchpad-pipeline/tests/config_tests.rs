//! Configuration loading and validation tests

use anyhow::Result;
use launchpad_pipeline::config::{ChainMode, PipelineConfig};
use std::fs;
use tempfile::TempDir;

fn create_test_config_content() -> String {
    r#"
[database]
postgres_url = "postgresql://launchpad:launchpad@db:5432/launchpad"
max_connections = 30
run_migrations = false

[redis]
url = "redis://cache:6379"

[chain]
mode = "mock"
rpc_url = "http://node:8545"
chain_id = 8453
minter_address = "0x00000000000000000000000000000000000000AB"
custody_address = "0x00000000000000000000000000000000000000cc"
request_timeout_secs = 10
authorizer_secret = "test-secret"

[queue]
visibility_timeout_secs = 600
max_attempts = 5

[allocation]
hold_ttl_secs = 300
staleness_window_secs = 30

[worker]
lock_ttl_secs = 45
receipt_timeout_secs = 240

[confirmation]
required_confirmations = 12

[monitoring]
metrics_port = 9191
log_level = "debug"
structured_logging = false
"#
    .to_string()
}

#[tokio::test]
async fn test_config_loading_from_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("launchpad.toml");
    fs::write(&config_path, create_test_config_content())?;

    let config = PipelineConfig::from_file(config_path.to_str().unwrap())?;

    assert_eq!(config.database.max_connections, 30);
    assert!(!config.database.run_migrations);
    assert_eq!(config.redis.url, "redis://cache:6379");
    assert_eq!(config.chain.mode, ChainMode::Mock);
    assert_eq!(config.chain.chain_id, 8453);
    assert_eq!(config.chain.custody(), "0x00000000000000000000000000000000000000cc");
    assert_eq!(config.queue.max_attempts, 5);
    assert_eq!(config.allocation.hold_ttl_secs, 300);
    assert_eq!(config.confirmation.required_confirmations, 12);
    assert_eq!(config.monitoring.metrics_port, 9191);

    // Sections left out keep their defaults
    assert_eq!(config.upload.timeout_secs, 30);
    assert_eq!(config.worker.lock_key, "launchpad:mint:lock");
    assert_eq!(config.allocation.queued_hold_ttl_secs, 3600);

    Ok(())
}

#[tokio::test]
async fn test_layered_load_matches_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("launchpad.toml");
    fs::write(&config_path, create_test_config_content())?;

    let config = PipelineConfig::load(Some(config_path.to_str().unwrap()))?;
    assert_eq!(config.chain.chain_id, 8453);
    assert_eq!(config.allocation.staleness_window_secs, 30);
    assert_eq!(config.worker.lock_ttl_secs, 45);

    Ok(())
}

#[tokio::test]
async fn test_load_without_file_uses_defaults() -> Result<()> {
    let config = PipelineConfig::load(None)?;
    assert_eq!(config.chain.rpc_url, "http://localhost:8545");
    assert_eq!(config.allocation.hold_ttl_secs, 120);
    Ok(())
}

#[tokio::test]
async fn test_environment_overrides_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("launchpad.toml");
    fs::write(&config_path, create_test_config_content())?;

    std::env::set_var("MINTPAD__CONFIRMATION__PENDING_TTL_SECS", "900");
    let loaded = PipelineConfig::load(Some(config_path.to_str().unwrap()));
    std::env::remove_var("MINTPAD__CONFIRMATION__PENDING_TTL_SECS");

    let config = loaded?;
    assert_eq!(config.confirmation.pending_ttl_secs, 900);
    assert_eq!(config.confirmation.required_confirmations, 12);
    Ok(())
}

#[tokio::test]
async fn test_config_validation() -> Result<()> {
    assert!(PipelineConfig::default().validate().is_ok());

    let mut config = PipelineConfig::default();
    config.chain.minter_address = "0x1234".to_string();
    assert!(config.validate().is_err());

    let mut config = PipelineConfig::default();
    config.queue.max_attempts = 0;
    assert!(config.validate().is_err());

    // Visibility must outlast a full receipt wait
    let mut config = PipelineConfig::default();
    config.queue.visibility_timeout_secs = 60;
    config.worker.receipt_timeout_secs = 120;
    assert!(config.validate().is_err());

    let mut config = PipelineConfig::default();
    config.chain.transfer_topic = "0xddf252ad".to_string();
    assert!(config.validate().is_err());

    let mut config = PipelineConfig::default();
    config.database.postgres_url = "not a url".to_string();
    assert!(config.validate().is_err());

    Ok(())
}

#[tokio::test]
async fn test_invalid_file_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let broken = temp_dir.path().join("broken.toml");
    fs::write(&broken, "[queue\nmax_attempts = 3")?;
    assert!(PipelineConfig::from_file(broken.to_str().unwrap()).is_err());

    let out_of_range = temp_dir.path().join("range.toml");
    fs::write(&out_of_range, "[confirmation]\nrequired_confirmations = 0\n")?;
    assert!(PipelineConfig::from_file(out_of_range.to_str().unwrap()).is_err());

    assert!(PipelineConfig::from_file("/nonexistent/launchpad.toml").is_err());
    Ok(())
}
