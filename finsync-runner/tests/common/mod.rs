//! Shared fixtures for runner integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use polars::prelude::*;

use finsync_core::catalog::FieldCatalog;
use finsync_core::config::EngineConfig;
use finsync_core::error::DataError;
use finsync_core::frame::{date_column, TableFrame};
use finsync_core::ledger::CoverageLedger;
use finsync_core::plugin::{FetchParams, Plugin, PluginInfo, PluginRegistry};
use finsync_core::series::SeriesDescriptor;
use finsync_core::store::{DocumentStore, MemoryStore};
use finsync_core::time::{DurationClass, TimeRange};
use finsync_runner::SyncOrchestrator;

pub const PRICES: &str = "Test.Prices";
pub const CALENDAR: &str = "Test.Calendar";
/// Like `PRICES` but with a listing date of 2024-01-03 as reference since.
pub const LISTED: &str = "Test.Listed";

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn config(as_of: NaiveDate) -> EngineConfig {
    EngineConfig {
        default_since: d(2024, 1, 1),
        as_of: Some(as_of),
        ..EngineConfig::default()
    }
}

/// Serves a daily price series keyed by `code` plus an unkeyed calendar.
///
/// Every fetch is counted and recorded. Prices are synthesized one row per
/// day of the window, `close = day of month`.
pub struct StubSource {
    pub entities: Vec<String>,
    pub failing: Mutex<HashSet<String>>,
    pub drop_close: AtomicBool,
    pub available: AtomicBool,
    /// Trip availability after this many fetches.
    pub trip_after: Mutex<Option<usize>>,
    pub fetches: AtomicUsize,
    pub calls: Mutex<Vec<(Option<String>, Option<TimeRange>)>>,
}

impl StubSource {
    pub fn new(entities: &[&str]) -> Self {
        Self {
            entities: entities.iter().map(|s| s.to_string()).collect(),
            failing: Mutex::new(HashSet::new()),
            drop_close: AtomicBool::new(false),
            available: AtomicBool::new(true),
            trip_after: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for(self, entities: &[&str]) -> Self {
        self.failing
            .lock()
            .unwrap()
            .extend(entities.iter().map(|s| s.to_string()));
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn last_call(&self) -> Option<(Option<String>, Option<TimeRange>)> {
        self.calls.lock().unwrap().last().cloned()
    }
}

pub fn price_rows(code: &str, range: &TimeRange, with_close: bool) -> TableFrame {
    let (Some(mut day), Some(until)) = (range.since, range.until) else {
        return DataFrame::empty();
    };
    let mut dates = Vec::new();
    while day <= until {
        dates.push(Some(day));
        day = day.succ_opt().unwrap();
    }
    let closes: Vec<f64> = dates
        .iter()
        .map(|d| chrono::Datelike::day(&d.unwrap()) as f64)
        .collect();
    let mut cols = vec![
        Column::new("code".into(), vec![code; dates.len()]),
        date_column("date", &dates).unwrap(),
        Column::new("volume".into(), vec![100.0; dates.len()]),
    ];
    if with_close {
        cols.push(Column::new("close".into(), closes));
    }
    DataFrame::new(cols).unwrap()
}

impl Plugin for StubSource {
    fn probe(&self) -> PluginInfo {
        let mut fields = BTreeMap::new();
        fields.insert(
            PRICES.to_string(),
            BTreeMap::from([
                ("close".to_string(), "Close".to_string()),
                ("volume".to_string(), "Volume".to_string()),
            ]),
        );
        fields.insert(
            CALENDAR.to_string(),
            BTreeMap::from([("holiday".to_string(), "Holiday".to_string())]),
        );
        PluginInfo {
            id: "stub".into(),
            name: "Stub source".into(),
            version: "0.0.1".into(),
            fields,
            ..Default::default()
        }
    }

    fn series(&self) -> Vec<SeriesDescriptor> {
        let entities = self.entities.clone();
        vec![
            SeriesDescriptor::builder(PRICES)
                .identity_field("code")
                .time_field("date")
                .duration(DurationClass::Daily)
                .alias("prices")
                .required_fields(&["date", "close"])
                .update_enumerator(move || entities.clone())
                .build(),
            SeriesDescriptor::builder(LISTED)
                .identity_field("code")
                .time_field("date")
                .duration(DurationClass::Daily)
                .required_fields(&["date", "close"])
                .reference_range(|_| TimeRange::new(Some(d(2024, 1, 3)), None))
                .build(),
            SeriesDescriptor::builder(CALENDAR).build(),
        ]
    }

    fn fetch(
        &self,
        uri: &str,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        _params: &FetchParams,
    ) -> Result<Option<TableFrame>, DataError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .unwrap()
            .push((entity.map(str::to_string), range.copied()));
        if let Some(limit) = *self.trip_after.lock().unwrap() {
            if n >= limit {
                self.available.store(false, Ordering::SeqCst);
            }
        }

        if uri == CALENDAR {
            let frame = DataFrame::new(vec![Column::new(
                "holiday".into(),
                vec!["2024-01-01", "2024-12-25"],
            )])
            .unwrap();
            return Ok(Some(frame));
        }

        let code = entity.unwrap_or("?");
        if self.failing.lock().unwrap().contains(code) {
            return Err(DataError::NetworkUnreachable(format!("no route to {code}")));
        }
        let range = range
            .copied()
            .unwrap_or_else(|| TimeRange::between(d(2024, 1, 1), d(2024, 1, 3)));
        let frame = price_rows(code, &range, !self.drop_close.load(Ordering::SeqCst));
        Ok((frame.height() > 0).then_some(frame))
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub source: Arc<StubSource>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<CoverageLedger>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

pub fn harness(source: StubSource, as_of: NaiveDate) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CoverageLedger::in_memory());
    let orchestrator = orchestrator_for(&source, &store, &ledger, as_of);
    Harness {
        source,
        store,
        ledger,
        orchestrator,
    }
}

/// A fresh orchestrator over existing storage and ledger, e.g. to move
/// "today" forward.
pub fn orchestrator_for(
    source: &Arc<StubSource>,
    store: &Arc<MemoryStore>,
    ledger: &Arc<CoverageLedger>,
    as_of: NaiveDate,
) -> Arc<SyncOrchestrator> {
    orchestrator_over(source, store.clone(), ledger, as_of)
}

/// Same as [`orchestrator_for`] over any store.
pub fn orchestrator_over(
    source: &Arc<StubSource>,
    store: Arc<dyn DocumentStore>,
    ledger: &Arc<CoverageLedger>,
    as_of: NaiveDate,
) -> Arc<SyncOrchestrator> {
    let mut registry = PluginRegistry::new(store);
    registry.register(source.clone());
    let catalog = Arc::new(FieldCatalog::new(registry.probes()));

    Arc::new(SyncOrchestrator::new(
        Arc::new(registry),
        Arc::clone(ledger),
        catalog,
        &config(as_of),
    ))
}
