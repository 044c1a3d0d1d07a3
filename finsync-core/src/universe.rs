//! Entity universe: named groups of entity ids (e.g. sector -> tickers).
//!
//! Loaded from TOML and used as the update enumerator for entity-keyed
//! series whose entities are not discoverable from storage.
//!
//! ```toml
//! [groups]
//! ETFs = ["SPY", "QQQ"]
//! Technology = ["AAPL", "MSFT"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Universe {
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Universe {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Every entity across all groups, deduplicated and sorted.
    pub fn entities(&self) -> Vec<String> {
        self.groups
            .values()
            .flatten()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    /// A small US equity/ETF universe used when none is configured.
    pub fn default_us() -> Self {
        let group = |tickers: &[&str]| -> Vec<String> {
            tickers.iter().map(|t| t.to_string()).collect()
        };
        let mut groups = BTreeMap::new();
        groups.insert("ETFs".to_string(), group(&["SPY", "QQQ", "IWM", "DIA"]));
        groups.insert(
            "Technology".to_string(),
            group(&["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA"]),
        );
        groups.insert("Finance".to_string(), group(&["JPM", "BAC", "GS"]));
        groups.insert("Energy".to_string(), group(&["XOM", "CVX"]));
        Self { groups }
    }
}
