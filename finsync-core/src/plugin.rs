//! Plugin contract and the explicit registry that replaces module discovery.
//!
//! A plugin is a compiled unit that declares series (with their storage
//! shape), fetches data for them, and/or provides factor definitions. The
//! [`PluginRegistry`] owns every registered plugin and builds one
//! [`SeriesAgent`] per declared series.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DataError;
use crate::factor::FactorDescriptor;
use crate::frame::TableFrame;
use crate::series::{SeriesAgent, SeriesDescriptor};
use crate::store::DocumentStore;
use crate::time::TimeRange;

/// Free-form extra fetch parameters.
pub type FetchParams = BTreeMap<String, String>;

/// What a plugin reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// `uri -> (internal field -> human label)`
    #[serde(default)]
    pub fields: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
}

pub trait Plugin: Send + Sync {
    fn probe(&self) -> PluginInfo;

    /// Series this plugin serves.
    fn series(&self) -> Vec<SeriesDescriptor> {
        Vec::new()
    }

    /// Whether this plugin can fetch `uri`.
    fn adapts(&self, uri: &str) -> bool {
        self.series().iter().any(|s| s.matches(uri))
    }

    /// Fetch a window of a series. `Ok(None)` means nothing is available.
    fn fetch(
        &self,
        uri: &str,
        _entity: Option<&str>,
        _range: Option<&TimeRange>,
        _params: &FetchParams,
    ) -> Result<Option<TableFrame>, DataError> {
        Err(DataError::NoSuchSeries {
            uri: uri.to_string(),
        })
    }

    fn factors(&self) -> Vec<FactorDescriptor> {
        Vec::new()
    }

    /// False while the upstream is known to be unusable (e.g. circuit open).
    fn is_available(&self) -> bool {
        true
    }
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    info: PluginInfo,
}

pub struct PluginRegistry {
    store: Arc<dyn DocumentStore>,
    plugins: Vec<Registered>,
    /// `(index into plugins, agent)`
    agents: Vec<(usize, SeriesAgent)>,
}

impl PluginRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            plugins: Vec::new(),
            agents: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let info = plugin.probe();
        if self.plugins.iter().any(|p| p.info.id == info.id) {
            warn!(plugin = %info.id, "plugin registered twice");
        }

        let idx = self.plugins.len();
        let series = plugin.series();
        for desc in series {
            if let Some((_, existing)) = self.agents.iter().find(|(_, a)| a.adapt(&desc.uri)) {
                warn!(
                    uri = %desc.uri,
                    existing = %existing.uri(),
                    "series already served by another agent, first registration wins lookups"
                );
            }
            self.agents
                .push((idx, SeriesAgent::new(desc, Arc::clone(&self.store))));
        }

        info!(
            plugin = %info.id,
            version = %info.version,
            series = self.agents.iter().filter(|(i, _)| *i == idx).count(),
            factors = info.factors.len(),
            "registered plugin"
        );
        self.plugins.push(Registered { plugin, info });
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter().map(|r| &r.plugin)
    }

    /// Cached probe output of every plugin, in registration order.
    pub fn probes(&self) -> Vec<PluginInfo> {
        self.plugins.iter().map(|r| r.info.clone()).collect()
    }

    pub fn agents(&self) -> impl Iterator<Item = &SeriesAgent> {
        self.agents.iter().map(|(_, a)| a)
    }

    pub fn agent_for(&self, uri: &str) -> Option<&SeriesAgent> {
        self.agents.iter().map(|(_, a)| a).find(|a| a.adapt(uri))
    }

    /// The plugin to fetch `uri` from: the owner of the matching agent,
    /// else the first plugin whose `adapts` accepts it.
    pub fn fetcher_for(&self, uri: &str) -> Option<&Arc<dyn Plugin>> {
        if let Some((idx, _)) = self.agents.iter().find(|(_, a)| a.adapt(uri)) {
            return Some(&self.plugins[*idx].plugin);
        }
        self.plugins
            .iter()
            .map(|r| &r.plugin)
            .find(|p| p.adapts(uri))
    }

    /// `(plugin id, descriptors)` for every plugin that provides factors.
    pub fn factor_descriptors(&self) -> Vec<(String, Vec<FactorDescriptor>)> {
        self.plugins
            .iter()
            .map(|r| (r.info.id.clone(), r.plugin.factors()))
            .filter(|(_, f)| !f.is_empty())
            .collect()
    }
}
