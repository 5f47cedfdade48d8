//! Runtime configuration: amount limits and store settings.
//!
//! Values come from an optional YAML file, then environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::Amount;

pub const CONFIG_PATH_VAR: &str = "LEDGER_CONFIG";
pub const DATA_FILE_VAR: &str = "LEDGER_DATA_FILE";
pub const LOCK_TIMEOUT_VAR: &str = "LEDGER_LOCK_TIMEOUT_MS";
pub const UNIT_OF_WORK_TIMEOUT_VAR: &str = "LEDGER_UNIT_OF_WORK_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid limits: {0}")]
    InvalidLimits(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub store: StoreConfig,
}

/// Bounds applied to amounts before any storage access.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub min_transfer: Amount,
    pub max_transfer: Amount,
    pub max_initial_balance: Amount,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_transfer: Amount::new(Decimal::new(1, 2)),
            max_transfer: Amount::from_int(1_000_000_000),
            max_initial_balance: Amount::from_int(10_000_000_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Commit log location. `None` keeps the store purely in memory.
    pub data_file: Option<PathBuf>,
    /// fsync the commit log after every commit.
    pub sync_writes: bool,
    pub lock_timeout_ms: u64,
    pub unit_of_work_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file: None,
            sync_writes: true,
            lock_timeout_ms: 5_000,
            unit_of_work_timeout_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn unit_of_work_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_of_work_timeout_ms)
    }
}

impl Config {
    /// Load from the file named by `LEDGER_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(path) = lookup(DATA_FILE_VAR) {
            self.store.data_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(value) = lookup(LOCK_TIMEOUT_VAR) {
            self.store.lock_timeout_ms = parse_millis(LOCK_TIMEOUT_VAR, value)?;
        }
        if let Some(value) = lookup(UNIT_OF_WORK_TIMEOUT_VAR) {
            self.store.unit_of_work_timeout_ms = parse_millis(UNIT_OF_WORK_TIMEOUT_VAR, value)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if !limits.min_transfer.is_positive() {
            return Err(ConfigError::InvalidLimits(
                "min_transfer must be positive".to_string(),
            ));
        }
        if limits.max_transfer < limits.min_transfer {
            return Err(ConfigError::InvalidLimits(
                "max_transfer is below min_transfer".to_string(),
            ));
        }
        if limits.max_initial_balance.is_negative() {
            return Err(ConfigError::InvalidLimits(
                "max_initial_balance is negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidEnv { var, value }),
    }
}
