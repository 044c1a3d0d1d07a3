//! Batch updates across every entity of a series.
//!
//! Fetching runs on the calling thread, one entity at a time, so upstream
//! sees serialized requests. Each fetched patch is handed to a private
//! single-thread rayon pool for merge and ledger writes, which overlaps
//! storage I/O with the next fetch. Completions come back over an `mpsc`
//! channel; at most `max_in_flight` patches may be waiting on the pool.
//!
//! ```text
//! Idle -> Fetching(e0) -> Persisting(e0) ... -> Done | Aborted | Cancelled
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use finsync_core::config::{EngineConfig, DEFAULT_MAX_FAILURE_RATIO, DEFAULT_MAX_IN_FLIGHT};
use finsync_core::error::DataError;
use finsync_core::time::TimeRange;

use crate::orchestrator::SyncOrchestrator;
use crate::patch::Patch;
use crate::progress::UpdateProgress;

/// How each entity's window is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// No time window: fetch whatever the source returns for the entity.
    None,
    /// The window from `calc_update_range`.
    #[default]
    Auto,
    /// `(default_since, today)`, ignoring the ledger.
    Force,
    /// This window, used as the override for `calc_update_range`.
    Explicit(TimeRange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Done,
    /// Too many fetch failures, or the source became unavailable.
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UpdateSummary {
    pub uri: String,
    pub state: RunState,
    pub total: usize,
    /// Entities whose fetch was started.
    pub attempted: usize,
    /// Successful fetches handed to persistence.
    pub fetched: usize,
    /// Patches merged and recorded.
    pub applied: usize,
    /// `(entity, message)` for every failed fetch, apply or skipped entity.
    pub failures: Vec<(String, String)>,
}

impl UpdateSummary {
    fn new(uri: &str, total: usize) -> Self {
        Self {
            uri: uri.to_string(),
            state: RunState::Done,
            total,
            attempted: 0,
            fetched: 0,
            applied: 0,
            failures: Vec::new(),
        }
    }

    fn aborted(uri: &str, entity: &str, message: String) -> Self {
        Self {
            state: RunState::Aborted,
            failures: vec![(entity.to_string(), message)],
            ..Self::new(uri, 0)
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn all_succeeded(&self) -> bool {
        self.is_done() && self.failures.is_empty()
    }
}

struct Applied {
    entity: String,
    result: Result<(), String>,
}

pub struct BatchUpdateDriver {
    orchestrator: Arc<SyncOrchestrator>,
    max_in_flight: usize,
    max_failure_ratio: f64,
    cancel: Arc<AtomicBool>,
}

impl BatchUpdateDriver {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_failure_ratio: DEFAULT_MAX_FAILURE_RATIO,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(orchestrator: Arc<SyncOrchestrator>, config: &EngineConfig) -> Self {
        Self::new(orchestrator).with_limits(config.max_in_flight, config.max_failure_ratio)
    }

    pub fn with_limits(mut self, max_in_flight: usize, max_failure_ratio: f64) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self.max_failure_ratio = max_failure_ratio;
        self
    }

    /// Share an external cancellation flag. A run that observes the flag
    /// clears it, so one request cancels one run.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn fetch_one(&self, uri: &str, entity: Option<&str>, policy: &RangePolicy) -> Patch {
        let orch = &self.orchestrator;
        match policy {
            RangePolicy::None => orch.build_full_patch(uri, entity),
            RangePolicy::Auto => orch.build_patch(uri, entity, None, false),
            RangePolicy::Force => orch.build_patch(uri, entity, None, true),
            RangePolicy::Explicit(range) => orch.build_patch(uri, entity, Some(range), false),
        }
    }

    /// Update `uri` for `entities`, or for the agent's update entities when
    /// `None`. Series without an identity field run once for the whole
    /// series.
    pub fn run(
        &self,
        uri: &str,
        entities: Option<Vec<String>>,
        policy: &RangePolicy,
        progress: &dyn UpdateProgress,
    ) -> UpdateSummary {
        let registry = self.orchestrator.registry();
        let Some(agent) = registry.agent_for(uri) else {
            let e = DataError::NoSuchSeries {
                uri: uri.to_string(),
            };
            error!(error = %e, "batch update aborted");
            let summary = UpdateSummary::aborted(uri, uri, e.to_string());
            progress.on_batch_complete(&summary);
            return summary;
        };
        let series_uri = agent.uri().to_string();

        let work: Vec<Option<String>> = if agent.descriptor().identity_field.is_none() {
            vec![None]
        } else {
            let entities = match entities {
                Some(list) => list,
                None => match agent.update_entities() {
                    Ok(list) => list,
                    Err(e) => {
                        error!(uri = %series_uri, error = %e, "cannot enumerate entities");
                        let summary =
                            UpdateSummary::aborted(&series_uri, &series_uri, e.to_string());
                        progress.on_batch_complete(&summary);
                        return summary;
                    }
                },
            };
            entities.into_iter().map(Some).collect()
        };

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("finsync-persist-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                let summary = UpdateSummary::aborted(
                    &series_uri,
                    &series_uri,
                    format!("failed to start persistence worker: {e}"),
                );
                progress.on_batch_complete(&summary);
                return summary;
            }
        };

        let fetcher = registry.fetcher_for(&series_uri);
        let total = work.len();
        let mut summary = UpdateSummary::new(&series_uri, total);
        let mut fetch_failures = 0usize;
        let (tx, rx) = mpsc::channel::<Applied>();
        let mut completed = 0usize;

        let record = |summary: &mut UpdateSummary, applied: Applied| match applied.result {
            Ok(()) => summary.applied += 1,
            Err(e) => summary.failures.push((applied.entity, e)),
        };

        info!(uri = %series_uri, entities = total, ?policy, "starting batch update");

        for (index, entity) in work.iter().enumerate() {
            let label = entity.as_deref().unwrap_or(&series_uri).to_string();

            if self.cancel.swap(false, Ordering::Relaxed) {
                info!(uri = %series_uri, at = index, "batch update cancelled");
                summary.state = RunState::Cancelled;
                break;
            }

            while summary.fetched - completed >= self.max_in_flight {
                debug!(in_flight = summary.fetched - completed, "waiting on persistence");
                match rx.recv() {
                    Ok(applied) => {
                        completed += 1;
                        record(&mut summary, applied);
                    }
                    Err(_) => break,
                }
            }

            progress.on_start(&label, index, total);
            summary.attempted += 1;
            let patch = self.fetch_one(&series_uri, entity.as_deref(), policy);

            if patch.success {
                progress.on_complete(&label, index, total, &Ok(patch.rows()));
                summary.fetched += 1;
                let orch = Arc::clone(&self.orchestrator);
                let tx = tx.clone();
                let entity = label.clone();
                pool.spawn(move || {
                    let result = orch.try_apply_patch(patch);
                    let _ = tx.send(Applied { entity, result });
                });
            } else {
                let message = patch.error.unwrap_or_else(|| "fetch failed".to_string());
                progress.on_complete(&label, index, total, &Err(message.clone()));
                summary.failures.push((label.clone(), message));
                fetch_failures += 1;

                let ratio = fetch_failures as f64 / total as f64;
                if ratio > self.max_failure_ratio {
                    warn!(
                        uri = %series_uri,
                        failed = fetch_failures,
                        total,
                        "failure ratio exceeded, aborting batch"
                    );
                    summary.state = RunState::Aborted;
                    break;
                }
            }

            if fetcher.is_some_and(|p| !p.is_available()) {
                warn!(uri = %series_uri, "source unavailable, aborting batch");
                for rest in &work[index + 1..] {
                    let rest = rest.as_deref().unwrap_or(&series_uri).to_string();
                    summary
                        .failures
                        .push((rest, DataError::CircuitBreakerTripped.to_string()));
                }
                summary.state = RunState::Aborted;
                break;
            }
        }

        drop(tx);
        while completed < summary.fetched {
            match rx.recv() {
                Ok(applied) => {
                    completed += 1;
                    record(&mut summary, applied);
                }
                Err(_) => break,
            }
        }

        if summary.state == RunState::Done {
            if let Err(e) = self.orchestrator.try_touch_series(&series_uri) {
                warn!(uri = %series_uri, error = %e, "failed to record sweep");
                summary.failures.push((series_uri.clone(), e));
            }
        }

        progress.on_batch_complete(&summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_states() {
        let mut summary = UpdateSummary::new("Market.DailyBar", 3);
        assert!(summary.all_succeeded());
        summary.failures.push(("SPY".into(), "boom".into()));
        assert!(summary.is_done());
        assert!(!summary.all_succeeded());

        let aborted = UpdateSummary::aborted("x", "x", "no such series".into());
        assert_eq!(aborted.state, RunState::Aborted);
        assert_eq!(aborted.total, 0);
        assert_eq!(aborted.failures.len(), 1);
    }

    #[test]
    fn auto_is_the_default_policy() {
        assert_eq!(RangePolicy::default(), RangePolicy::Auto);
    }
}
