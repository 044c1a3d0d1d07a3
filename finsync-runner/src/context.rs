//! The process-wide context: built once at startup and passed to every
//! component that needs storage, the ledger or the plugin registry.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use finsync_core::catalog::FieldCatalog;
use finsync_core::collectors::YahooCollector;
use finsync_core::config::{ConfigError, EngineConfig};
use finsync_core::error::DataError;
use finsync_core::factor::{FactorGraph, FormulaPlugin};
use finsync_core::ledger::{CoverageLedger, LedgerError};
use finsync_core::plugin::{Plugin, PluginRegistry};
use finsync_core::store::{DocumentStore, ParquetStore};
use finsync_core::universe::Universe;

use crate::driver::BatchUpdateDriver;
use crate::evaluator::FactorEvaluator;
use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage: {0}")]
    Data(#[from] DataError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct Context {
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    ledger: Arc<CoverageLedger>,
    plugins: Vec<Arc<dyn Plugin>>,
    orchestrator: Arc<SyncOrchestrator>,
    graph: Arc<FactorGraph>,
}

impl Context {
    /// Open the Parquet store and ledger under `config.data_dir` and register
    /// the built-in plugins.
    pub fn open(config: EngineConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let store: Arc<dyn DocumentStore> = Arc::new(ParquetStore::open(config.store_dir())?);
        let ledger = Arc::new(CoverageLedger::open(config.ledger_path())?);

        let universe = match &config.universe_file {
            Some(path) => Universe::from_file(path)?,
            None => Universe::default_us(),
        };
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(YahooCollector::new(universe)?),
            Arc::new(FormulaPlugin::new(&config.formulas)),
        ];

        info!(data_dir = %config.data_dir.display(), "opened context");
        Ok(Self::with_plugins(config, store, ledger, plugins))
    }

    /// Build from explicit collaborators. No I/O.
    pub fn with_plugins(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        ledger: Arc<CoverageLedger>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Self {
        let (orchestrator, graph) = Self::wire(&config, &store, &ledger, &plugins);
        Self {
            config,
            store,
            ledger,
            plugins,
            orchestrator,
            graph,
        }
    }

    fn wire(
        config: &EngineConfig,
        store: &Arc<dyn DocumentStore>,
        ledger: &Arc<CoverageLedger>,
        plugins: &[Arc<dyn Plugin>],
    ) -> (Arc<SyncOrchestrator>, Arc<FactorGraph>) {
        let mut registry = PluginRegistry::new(Arc::clone(store));
        for plugin in plugins {
            registry.register(Arc::clone(plugin));
        }

        let mut graph = FactorGraph::new();
        for (plugin_id, descriptors) in registry.factor_descriptors() {
            graph.register_all(&plugin_id, descriptors);
        }

        let catalog = Arc::new(FieldCatalog::new(registry.probes()));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(registry),
            Arc::clone(ledger),
            catalog,
            config,
        ));
        (orchestrator, Arc::new(graph))
    }

    /// Rebuild the registry, catalog and factor graph from scratch. Storage
    /// and the ledger are kept.
    pub fn reload_plugins(&mut self, plugins: Vec<Arc<dyn Plugin>>) {
        let (orchestrator, graph) = Self::wire(&self.config, &self.store, &self.ledger, &plugins);
        self.plugins = plugins;
        self.orchestrator = orchestrator;
        self.graph = graph;
        info!(
            plugins = self.plugins.len(),
            factors = self.graph.len(),
            "reloaded plugins"
        );
    }

    /// Recompile `[formulas]` after the config changed.
    pub fn reload_formulas(&mut self, config: EngineConfig) {
        let mut plugins: Vec<Arc<dyn Plugin>> = self
            .plugins
            .iter()
            .filter(|p| p.probe().id != FormulaPlugin::ID)
            .cloned()
            .collect();
        plugins.push(Arc::new(FormulaPlugin::new(&config.formulas)));
        self.config = config;
        self.reload_plugins(plugins);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn ledger(&self) -> &CoverageLedger {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &PluginRegistry {
        self.orchestrator.registry()
    }

    pub fn catalog(&self) -> &FieldCatalog {
        self.orchestrator.catalog()
    }

    pub fn graph(&self) -> &Arc<FactorGraph> {
        &self.graph
    }

    pub fn driver(&self) -> BatchUpdateDriver {
        BatchUpdateDriver::from_config(Arc::clone(&self.orchestrator), &self.config)
    }

    pub fn evaluator(&self) -> FactorEvaluator {
        FactorEvaluator::new(Arc::clone(&self.orchestrator), Arc::clone(&self.graph))
    }
}
