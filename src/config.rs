//! Application configuration
//!
//! Loaded from `config/<env>.yaml`. Engine and persistence sections are
//! optional and fall back to their defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::persistence::wal::DEFAULT_COMPACT_AFTER;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit `ledger_audit` records
    #[serde(default = "default_true")]
    pub audit_log: bool,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_true() -> bool {
    true
}

/// Transfer engine tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock lifetime requested per transfer; must outlast the slowest
    /// signing round-trip
    pub lock_timeout_ms: u64,
    /// Hard cap after which any lock is considered stale
    pub lock_ceiling_ms: u64,
    /// Extra attempts after lock contention
    pub lock_retry_attempts: u32,
    /// Base backoff between attempts, multiplied by the attempt number
    pub lock_retry_backoff_ms: u64,
    /// Walk the chain before each transfer
    pub verify_chain_before_transfer: bool,
    pub max_note_len: usize,
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_ceiling_ms: 60_000,
            lock_retry_attempts: 3,
            lock_retry_backoff_ms: 50,
            verify_chain_before_transfer: true,
            max_note_len: 256,
            sweep_interval_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_ceiling(&self) -> Duration {
        Duration::from_millis(self.lock_ceiling_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_timeout_ms == 0 {
            bail!("engine.lock_timeout_ms must be greater than zero");
        }
        if self.lock_timeout_ms > self.lock_ceiling_ms {
            bail!(
                "engine.lock_timeout_ms ({}) exceeds engine.lock_ceiling_ms ({})",
                self.lock_timeout_ms,
                self.lock_ceiling_ms
            );
        }
        if self.sweep_interval_ms == 0 {
            bail!("engine.sweep_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Wal,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
    /// WAL frames written between compactions
    pub compact_after_frames: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            data_dir: PathBuf::from("./data/ledger"),
            compact_after_frames: DEFAULT_COMPACT_AFTER,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        config.engine.validate()?;
        Ok(config)
    }
}
