//! finsync core: local storage, coverage ledger, series agents, plugins,
//! field catalog and the factor dependency engine.
//!
//! The sync loop itself (patch build/apply, batch driver, factor
//! evaluation) lives in `finsync-runner`.

pub mod catalog;
pub mod circuit_breaker;
pub mod collectors;
pub mod config;
pub mod error;
pub mod factor;
pub mod frame;
pub mod ledger;
pub mod plugin;
pub mod series;
pub mod store;
pub mod time;
pub mod universe;

pub use catalog::{FieldCatalog, UNKNOWN_URI};
pub use config::{ConfigError, EngineConfig};
pub use error::DataError;
pub use factor::{FactorDescriptor, FactorError, FactorGraph, ResolvedPlan};
pub use frame::TableFrame;
pub use ledger::{CoverageLedger, CoverageRecord, LedgerError};
pub use plugin::{FetchParams, Plugin, PluginInfo, PluginRegistry};
pub use series::{SeriesAgent, SeriesDescriptor};
pub use store::{DocumentStore, Filter, MemoryStore, ParquetStore};
pub use time::{DurationClass, TimeRange};
pub use universe::Universe;
