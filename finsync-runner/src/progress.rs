//! Progress reporting for batch updates.

use tracing::{info, warn};

use crate::driver::UpdateSummary;

pub trait UpdateProgress: Send + Sync {
    /// Called before an entity's window is fetched.
    fn on_start(&self, entity: &str, index: usize, total: usize);

    /// Called once an entity's fetch finished; `Ok` carries the row count.
    fn on_complete(
        &self,
        entity: &str,
        index: usize,
        total: usize,
        result: &Result<usize, String>,
    );

    /// Called once when the run ends, whatever its final state.
    fn on_batch_complete(&self, summary: &UpdateSummary);
}

/// Reports through `tracing`.
pub struct LogProgress;

impl UpdateProgress for LogProgress {
    fn on_start(&self, entity: &str, index: usize, total: usize) {
        info!("[{}/{}] updating {entity}", index + 1, total);
    }

    fn on_complete(
        &self,
        entity: &str,
        _index: usize,
        _total: usize,
        result: &Result<usize, String>,
    ) {
        match result {
            Ok(rows) => info!(entity, rows, "fetched"),
            Err(e) => warn!(entity, error = %e, "fetch failed"),
        }
    }

    fn on_batch_complete(&self, summary: &UpdateSummary) {
        info!(
            uri = %summary.uri,
            state = ?summary.state,
            total = summary.total,
            attempted = summary.attempted,
            applied = summary.applied,
            failed = summary.failures.len(),
            "update finished"
        );
    }
}

/// Discards every event.
pub struct SilentProgress;

impl UpdateProgress for SilentProgress {
    fn on_start(&self, _entity: &str, _index: usize, _total: usize) {}

    fn on_complete(
        &self,
        _entity: &str,
        _index: usize,
        _total: usize,
        _result: &Result<usize, String>,
    ) {
    }

    fn on_batch_complete(&self, _summary: &UpdateSummary) {}
}
