use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::{BatchOptions, ExecutionMode};
use crate::pool::PoolSettings;
use crate::retry::{Backoff, RetryPolicy};

/// Retry policy parameters (`[retry]` in config.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.5 = 500ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
    /// Double the backoff for throttling failures.
    pub throttle_retry: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 300,
            throttle_retry: false,
        }
    }
}

impl RetryConfig {
    /// Negative or non-finite base delays fall back to zero; larger ones are
    /// capped at `max_delay_secs`.
    pub fn policy(&self) -> RetryPolicy {
        let max_delay = Duration::from_secs(self.max_delay_secs);
        let base = match Duration::try_from_secs_f64(self.base_delay_secs) {
            Ok(d) => d.min(max_delay),
            Err(_) if self.base_delay_secs > 0.0 => max_delay,
            Err(_) => Duration::ZERO,
        };
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff {
                base_delay: base,
                max_delay,
            },
            throttle_retry: self.throttle_retry,
        }
    }
}

/// Connection pool parameters (`[pool]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Idle time after which a connection is stale.
    pub idle_timeout_secs: u64,
    pub connect_max_retries: u32,
    /// Period of the background sweeper, if the host runs one.
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout_secs: 30 * 60,
            connect_max_retries: 3,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections.max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            connect_max_retries: self.connect_max_retries,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Batch defaults (`[batch]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum items in flight; 1 runs sequentially.
    pub concurrency_limit: usize,
    pub continue_on_error: bool,
    pub per_item_max_retries: u32,
    pub conflict_is_success: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            continue_on_error: true,
            per_item_max_retries: 3,
            conflict_is_success: true,
        }
    }
}

impl BatchConfig {
    pub fn options(&self) -> BatchOptions {
        let mode = if self.concurrency_limit <= 1 {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel(self.concurrency_limit)
        };
        BatchOptions {
            mode,
            continue_on_error: self.continue_on_error,
            per_item_max_retries: self.per_item_max_retries,
            conflict_is_success: self.conflict_is_success,
        }
    }
}

/// Global configuration loaded from `~/.config/msp/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub batch: BatchConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("msp")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<CoreConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = CoreConfig::default();
        write_default(&path, &default_cfg)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(&path)
}

/// Load configuration from an explicit file. Missing sections take defaults.
pub fn load_from_path(path: &Path) -> Result<CoreConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: CoreConfig =
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

fn write_default(path: &Path, cfg: &CoreConfig) -> Result<()> {
    let toml = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml)?;
    Ok(())
}
