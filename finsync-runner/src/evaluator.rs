//! Evaluate named factors for one entity over a time window.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use finsync_core::catalog::UNKNOWN_URI;
use finsync_core::factor::{FactorError, FactorGraph};
use finsync_core::frame::{self, align_numeric, AlignedColumns, FrameSlice, TableFrame};
use finsync_core::time::TimeRange;

use crate::orchestrator::{QueryOptions, SyncOrchestrator};

/// Name of the output date column when no queried series is time-keyed.
pub const DEFAULT_TIME_FIELD: &str = "date";

pub struct FactorEvaluator {
    orchestrator: Arc<SyncOrchestrator>,
    graph: Arc<FactorGraph>,
}

impl FactorEvaluator {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, graph: Arc<FactorGraph>) -> Self {
        Self {
            orchestrator,
            graph,
        }
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    /// Compute `names` (factors or raw fields) for `entity` within `range`.
    ///
    /// Raw inputs are read from local storage, optionally synced first, and
    /// aligned on their dates. The result holds the date column followed by
    /// every requested name.
    pub fn evaluate(
        &self,
        names: &[String],
        entity: Option<&str>,
        range: &TimeRange,
        sync_first: bool,
    ) -> Result<TableFrame, FactorError> {
        let plan = self.graph.resolve(names)?;
        debug!(raw = ?plan.raw_fields, factors = ?plan.factors, "resolved factor plan");

        let catalog = self.orchestrator.catalog();
        let mut groups = catalog.fields_to_uri(&plan.raw_fields);
        if let Some(unknown) = groups.remove(UNKNOWN_URI) {
            warn!(fields = ?unknown, "no series provides these fields, dropping them");
        }

        let mut frames: Vec<(TableFrame, Option<String>, Vec<String>)> = Vec::new();
        let mut empty_fields: Vec<String> = Vec::new();
        let mut time_field: Option<String> = None;

        for (uri, fields) in &groups {
            let series_time = self
                .orchestrator
                .registry()
                .agent_for(uri)
                .and_then(|a| a.descriptor().time_field.clone());

            if sync_first && !self.orchestrator.update(uri, entity, Some(range), false) {
                warn!(
                    uri = %uri,
                    entity,
                    error = ?self.orchestrator.last_error(),
                    "sync before evaluation failed, using stored data"
                );
            }

            let mut projection = fields.clone();
            if let Some(tf) = &series_time {
                projection.push(tf.clone());
            }
            let options = QueryOptions {
                fields: Some(projection),
                ..QueryOptions::default()
            };
            match self.orchestrator.query(uri, entity, Some(range), &options) {
                Some(frame) => {
                    if time_field.is_none() {
                        time_field = series_time.clone();
                    }
                    frames.push((frame, series_time, fields.clone()));
                }
                None => {
                    warn!(uri = %uri, entity, "no stored rows for factor inputs");
                    empty_fields.extend(fields.iter().cloned());
                }
            }
        }

        let time_field = time_field.unwrap_or_else(|| DEFAULT_TIME_FIELD.to_string());
        let slices: Vec<FrameSlice<'_>> = frames
            .iter()
            .map(|(frame, tf, fields)| FrameSlice {
                frame,
                time_field: tf.as_deref(),
                fields,
            })
            .collect();
        let mut env = align_numeric(&slices)?;
        for field in &empty_fields {
            env.insert(field, Vec::new());
        }

        self.run_plan(&plan.factors, entity, range, &time_field, &mut env)?;

        let frame = env.to_frame(&time_field)?;
        let mut wanted: Vec<String> = Vec::with_capacity(names.len() + 1);
        if env.dates.is_some() {
            wanted.push(time_field);
        }
        wanted.extend(names.iter().filter(|n| env.get(n).is_some()).cloned());
        info!(entity, rows = env.len, columns = wanted.len(), "evaluated factors");
        Ok(frame::project(&frame, &wanted)?)
    }

    fn run_plan(
        &self,
        factors: &[String],
        entity: Option<&str>,
        range: &TimeRange,
        time_field: &str,
        env: &mut AlignedColumns,
    ) -> Result<(), FactorError> {
        let mut computed: BTreeSet<String> = BTreeSet::new();
        for name in factors {
            if computed.contains(name) {
                continue;
            }
            let inputs = env.to_frame(time_field)?;
            let output = self.graph.calculate(name, entity, range, &inputs)?;
            if output.height() != env.len && output.height() != 0 {
                return Err(FactorError::Compute {
                    factor: name.clone(),
                    reason: format!("returned {} rows for {} inputs", output.height(), env.len),
                });
            }

            for col in output.get_columns() {
                let column = col.name().to_string();
                if column == time_field || !self.graph.contains(&column) {
                    continue;
                }
                env.insert(&column, frame::numeric_values(col)?);
                computed.insert(column);
            }
            if !computed.contains(name) {
                return Err(FactorError::Compute {
                    factor: name.clone(),
                    reason: "output lacks the provided column".into(),
                });
            }
        }
        Ok(())
    }
}
