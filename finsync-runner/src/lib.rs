//! finsync runner: the sync loop on top of `finsync-core`.
//!
//! - [`SyncOrchestrator`] computes missing windows, builds and applies patches
//! - [`BatchUpdateDriver`] sweeps a series across its entities
//! - [`FactorEvaluator`] reads raw inputs and runs factor plans
//! - [`Context`] wires storage, ledger and plugins together once per process

pub mod context;
pub mod driver;
pub mod evaluator;
pub mod orchestrator;
pub mod patch;
pub mod progress;

pub use context::{Context, ContextError};
pub use driver::{BatchUpdateDriver, RangePolicy, RunState, UpdateSummary};
pub use evaluator::FactorEvaluator;
pub use orchestrator::{QueryOptions, SyncOrchestrator};
pub use patch::{Patch, SeriesKey};
pub use progress::{LogProgress, SilentProgress, UpdateProgress};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn shared_components_are_send_sync() {
        assert_send_sync::<SyncOrchestrator>();
        assert_send_sync::<BatchUpdateDriver>();
        assert_send_sync::<FactorEvaluator>();
        assert_send_sync::<Patch>();
    }
}
