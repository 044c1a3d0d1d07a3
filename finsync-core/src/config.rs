//! Engine configuration loaded from TOML.
//!
//! ```toml
//! data_dir = "data"
//! ledger_file = "data/ledger.jsonl"
//! default_since = "1990-01-01"
//! max_in_flight = 20
//! max_failure_ratio = 0.10
//! universe_file = "universe.toml"
//!
//! [formulas]
//! leverage = "[Leverage] = [total_liab] / [total_assets]"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistence work allowed to queue behind the fetch loop.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 20;
/// A batch aborts once strictly more than this share of entities failed.
pub const DEFAULT_MAX_FAILURE_RATIO: f64 = 0.10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_since() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_max_failure_ratio() -> f64 {
    DEFAULT_MAX_FAILURE_RATIO
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `{data_dir}/ledger.jsonl`.
    #[serde(default)]
    pub ledger_file: Option<PathBuf>,
    #[serde(default = "default_since")]
    pub default_since: NaiveDate,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
    /// Pins "today"; unset means the local date.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default)]
    pub universe_file: Option<PathBuf>,
    #[serde(default)]
    pub formulas: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger_file: None,
            default_since: default_since(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_failure_ratio: DEFAULT_MAX_FAILURE_RATIO,
            as_of: None,
            universe_file: None,
            formulas: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.max_failure_ratio) {
            return Err(ConfigError::Invalid(format!(
                "max_failure_ratio must be within [0, 1], got {}",
                self.max_failure_ratio
            )));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ledger.jsonl"))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}
