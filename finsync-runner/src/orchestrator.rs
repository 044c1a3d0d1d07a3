//! Incremental sync: decide what is missing, fetch it, merge it, record it.
//!
//! Every public operation reports failure through its return value plus a
//! last-error string; nothing here panics or propagates errors across the
//! orchestrator boundary.

use std::fmt::Display;
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use tracing::{debug, info, warn};

use finsync_core::catalog::FieldCatalog;
use finsync_core::config::EngineConfig;
use finsync_core::error::DataError;
use finsync_core::frame::{self, TableFrame};
use finsync_core::ledger::{series_tag, CoverageLedger};
use finsync_core::plugin::{FetchParams, PluginRegistry};
use finsync_core::series::SeriesAgent;
use finsync_core::store::Filter;
use finsync_core::time::TimeRange;

use crate::patch::{Patch, SeriesKey};

/// Read options for [`SyncOrchestrator::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub extra: Filter,
    pub fields: Option<Vec<String>>,
    /// Accept human labels in `fields` and return labelled columns.
    pub readable: bool,
}

pub struct SyncOrchestrator {
    registry: Arc<PluginRegistry>,
    ledger: Arc<CoverageLedger>,
    catalog: Arc<FieldCatalog>,
    default_since: NaiveDate,
    as_of: Option<NaiveDate>,
    last_error: Mutex<Option<String>>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        ledger: Arc<CoverageLedger>,
        catalog: Arc<FieldCatalog>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            catalog,
            default_since: config.default_since,
            as_of: config.as_of,
            last_error: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &CoverageLedger {
        &self.ledger
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    pub fn default_since(&self) -> NaiveDate {
        self.default_since
    }

    /// "Today": the configured `as_of`, else the local date.
    pub fn today(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn record_error(&self, err: impl Display) {
        let message = err.to_string();
        warn!(error = %message, "sync error");
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    fn agent(&self, uri: &str) -> Result<&SeriesAgent, DataError> {
        self.registry
            .agent_for(uri)
            .ok_or_else(|| DataError::NoSuchSeries {
                uri: uri.to_string(),
            })
    }

    /// Read stored rows. `None` when nothing matches or on error (see
    /// [`SyncOrchestrator::last_error`]).
    pub fn query(
        &self,
        uri: &str,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        options: &QueryOptions,
    ) -> Option<TableFrame> {
        let agent = match self.agent(uri) {
            Ok(agent) => agent,
            Err(e) => {
                self.record_error(e);
                return None;
            }
        };

        let fields = match (&options.fields, options.readable) {
            (Some(fields), true) => Some(self.catalog.to_fields(fields)),
            (fields, _) => fields.clone(),
        };

        let mut result = match agent.query(entity, range, &options.extra, fields.as_deref()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                self.record_error(e);
                return None;
            }
        };

        if options.readable {
            let labels = self.catalog.labels_for(&frame::column_names(&result));
            if let Err(e) = frame::rename_columns(&mut result, &labels) {
                self.record_error(e);
                return None;
            }
        }
        Some(result)
    }

    /// The window to fetch next for `(uri, entity)`.
    ///
    /// Each endpoint comes from the first source that has it: the explicit
    /// `override`, the agent's reference range, then the ledger (since) or
    /// today (until). When the reference since is already covered by the
    /// ledger only the forward gap is requested. Both endpoints are
    /// normalized to the series' reporting period; a since past the until
    /// collapses onto it unless both were given explicitly.
    ///
    /// Series keyed by neither entity nor time return an unbounded range.
    pub fn calc_update_range(
        &self,
        uri: &str,
        entity: Option<&str>,
        over: Option<&TimeRange>,
    ) -> Result<TimeRange, DataError> {
        let agent = self.agent(uri)?;
        let desc = agent.descriptor();
        if !desc.is_incremental() {
            return Ok(TimeRange::unbounded());
        }

        let over = over.copied().unwrap_or_default();
        let reference = agent.reference_range(entity);
        let record = self.ledger.get(&series_tag(&desc.uri, entity));

        let ledger_since = || {
            record
                .and_then(|r| r.until.or(r.last_refreshed.map(|t| t.date())))
                .unwrap_or(self.default_since)
        };

        let since = match (over.since, reference.since) {
            (Some(since), _) => since,
            (None, Some(ref_since)) => match record {
                Some(rec) if rec.since.is_some_and(|s| s <= ref_since) => {
                    rec.until.unwrap_or(ref_since)
                }
                _ => ref_since,
            },
            (None, None) => ledger_since(),
        };
        let until = over.until.or(reference.until).unwrap_or_else(|| self.today());

        let since = agent.normalize(since);
        let until = agent.normalize(until);
        let explicit = over.since.is_some() && over.until.is_some();
        let since = if since > until && !explicit { until } else { since };

        debug!(uri = %desc.uri, entity, %since, %until, "update range");
        Ok(TimeRange::between(since, until))
    }

    /// Fetch and validate the missing window of `(uri, entity)`.
    ///
    /// `force` ignores the ledger and the reference range: the window is
    /// `range` where given, else `(default_since, today)`.
    pub fn build_patch(
        &self,
        uri: &str,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        force: bool,
    ) -> Patch {
        let agent = match self.agent(uri) {
            Ok(agent) => agent,
            Err(e) => {
                self.record_error(&e);
                return Patch::failed(SeriesKey::new(uri, entity), None, e.to_string());
            }
        };
        let desc = agent.descriptor().clone();
        let key = SeriesKey::new(&desc.uri, entity);

        let window = if !desc.is_incremental() {
            let swept = self
                .ledger
                .get(&key.series_tag())
                .is_some_and(|r| r.last_refreshed.is_some());
            if swept && !force {
                debug!(series = %key, "non-incremental series already swept");
                return Patch::noop(key, desc, TimeRange::unbounded());
            }
            None
        } else {
            let window = if force {
                let over = range.copied().unwrap_or_default();
                TimeRange::between(
                    agent.normalize(over.since.unwrap_or(self.default_since)),
                    agent.normalize(over.until.unwrap_or_else(|| self.today())),
                )
            } else {
                match self.calc_update_range(&desc.uri, entity, range) {
                    Ok(window) => window,
                    Err(e) => {
                        self.record_error(&e);
                        return Patch::failed(key, Some(desc), e.to_string());
                    }
                }
            };
            if window.since == window.until {
                debug!(series = %key, "already current");
                return Patch::noop(key, desc, window);
            }
            Some(window.narrowed())
        };

        self.fetch_patch(agent, key, window)
    }

    /// Fetch `(uri, entity)` with no time window at all, ignoring the ledger.
    pub fn build_full_patch(&self, uri: &str, entity: Option<&str>) -> Patch {
        match self.agent(uri) {
            Ok(agent) => {
                let key = SeriesKey::new(agent.uri(), entity);
                self.fetch_patch(agent, key, None)
            }
            Err(e) => {
                self.record_error(&e);
                Patch::failed(SeriesKey::new(uri, entity), None, e.to_string())
            }
        }
    }

    fn fetch_patch(&self, agent: &SeriesAgent, key: SeriesKey, window: Option<TimeRange>) -> Patch {
        let desc = agent.descriptor().clone();
        let Some(fetcher) = self.registry.fetcher_for(&desc.uri) else {
            let e = DataError::NoSuchSeries {
                uri: desc.uri.clone(),
            };
            self.record_error(&e);
            return Patch::failed(key, Some(desc), e.to_string());
        };

        let fetched = fetcher.fetch(
            &desc.uri,
            key.entity.as_deref(),
            window.as_ref(),
            &FetchParams::new(),
        );
        let window = window.unwrap_or_default();
        let payload = match fetched {
            Ok(Some(frame)) if frame.height() > 0 => frame,
            Ok(_) => {
                debug!(series = %key, "nothing available upstream");
                return Patch::fetched(key, desc, window, None);
            }
            Err(e) => {
                let e = DataError::FetchFailed {
                    uri: key.to_string(),
                    reason: e.to_string(),
                };
                self.record_error(&e);
                return Patch::failed(key, Some(desc), e.to_string());
            }
        };

        let missing = agent.missing_fields(&payload);
        if !missing.is_empty() {
            let e = DataError::ShapeValidationFailed {
                uri: key.to_string(),
                missing,
            };
            self.record_error(&e);
            let mut patch = Patch::failed(key, Some(desc), e.to_string());
            patch.since = window.since;
            patch.until = window.until;
            patch.payload = Some(payload);
            return patch;
        }

        Patch::fetched(key, desc, window, Some(payload))
    }

    /// Merge a successful patch and widen the ledger for the series and,
    /// when present, the entity. The error is the failure message for this
    /// patch alone; `last_error` is left untouched.
    pub fn try_apply_patch(&self, patch: Patch) -> Result<(), String> {
        if !patch.success {
            return Err(format!(
                "refusing to apply failed patch for {}: {}",
                patch.key,
                patch.error.as_deref().unwrap_or("unknown error")
            ));
        }
        let Some(payload) = &patch.payload else {
            return Ok(());
        };

        let agent = self.agent(&patch.key.uri).map_err(|e| e.to_string())?;
        match agent.merge(&patch.key.uri, patch.key.entity.as_deref(), payload) {
            Ok(true) => {}
            Ok(false) => return Err(format!("merge rejected for {}", patch.key)),
            Err(e) => return Err(e.to_string()),
        }

        let tags = std::iter::once(patch.key.series_tag()).chain(patch.key.entity_tag());
        for tag in tags {
            self.widen(&tag, &patch.window()).map_err(|e| e.to_string())?;
        }

        info!(series = %patch.key, rows = patch.rows(), "applied patch");
        Ok(())
    }

    /// [`SyncOrchestrator::try_apply_patch`], reporting through `last_error`.
    pub fn apply_patch(&self, patch: Patch) -> bool {
        match self.try_apply_patch(patch) {
            Ok(()) => true,
            Err(e) => {
                self.record_error(e);
                false
            }
        }
    }

    fn widen(&self, tag: &str, window: &TimeRange) -> Result<(), finsync_core::LedgerError> {
        if let Some(since) = window.since {
            self.ledger.extend_since(tag, since)?;
        }
        if let Some(until) = window.until {
            self.ledger.extend_until(tag, until)?;
        }
        self.ledger.touch_refreshed(tag)
    }

    /// `build_patch` then `apply_patch`.
    pub fn update(
        &self,
        uri: &str,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        force: bool,
    ) -> bool {
        let patch = self.build_patch(uri, entity, range, force);
        patch.success && self.apply_patch(patch)
    }

    /// Mark a whole series as swept now.
    pub fn try_touch_series(&self, uri: &str) -> Result<(), String> {
        let uri = self.agent(uri).map_err(|e| e.to_string())?.uri().to_string();
        self.ledger
            .touch_refreshed(&series_tag(&uri, None))
            .map_err(|e| e.to_string())
    }

    pub fn touch_series(&self, uri: &str) -> bool {
        match self.try_touch_series(uri) {
            Ok(()) => true,
            Err(e) => {
                self.record_error(e);
                false
            }
        }
    }
}
