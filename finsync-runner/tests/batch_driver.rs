//! Batch sweeps: failure ratio, cancellation, source availability.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use finsync_core::error::DataError;
use finsync_core::frame::{self, TableFrame};
use finsync_core::ledger::{series_tag, CoverageLedger};
use finsync_core::store::{DocumentStore, Filter, MemoryStore};
use finsync_core::time::TimeRange;
use finsync_runner::{
    BatchUpdateDriver, RangePolicy, RunState, SilentProgress, UpdateProgress, UpdateSummary,
};

use common::{d, harness, orchestrator_over, StubSource, CALENDAR, PRICES};

const TEN: [&str; 10] = ["E0", "E1", "E2", "E3", "E4", "E5", "E6", "E7", "E8", "E9"];

#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    completed: AtomicUsize,
    batches: AtomicUsize,
    cancel_at: Option<(usize, Arc<AtomicBool>)>,
    final_state: Mutex<Option<RunState>>,
}

impl UpdateProgress for Recorder {
    fn on_start(&self, _entity: &str, _index: usize, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(
        &self,
        _entity: &str,
        index: usize,
        _total: usize,
        _result: &Result<usize, String>,
    ) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Some((at, flag)) = &self.cancel_at {
            if *at == index {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn on_batch_complete(&self, summary: &UpdateSummary) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        *self.final_state.lock().unwrap() = Some(summary.state);
    }
}

#[test]
fn one_failure_in_ten_completes() {
    let h = harness(StubSource::new(&TEN).fail_for(&["E4"]), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());
    let progress = Recorder::default();

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &progress);

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.total, 10);
    assert_eq!(summary.attempted, 10);
    assert_eq!(summary.applied, 9);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].0, "E4");
    assert_eq!(h.source.fetch_count(), 10);

    assert_eq!(progress.started.load(Ordering::SeqCst), 10);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 10);
    assert_eq!(progress.batches.load(Ordering::SeqCst), 1);
    assert!(h.ledger.get(&series_tag(PRICES, Some("E9"))).is_some());
    assert!(h.ledger.get(&series_tag(PRICES, Some("E4"))).is_none());
}

#[test]
fn two_failures_in_ten_abort() {
    let h = harness(StubSource::new(&TEN).fail_for(&["E3", "E7"]), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.attempted, 8);
    assert_eq!(summary.applied, 6);
    assert_eq!(h.source.fetch_count(), 8);
    assert!(h.ledger.get(&series_tag(PRICES, Some("E8"))).is_none());
}

#[test]
fn cancel_before_start_fetches_nothing() {
    let h = harness(StubSource::new(&TEN), d(2024, 1, 5));
    let cancel = Arc::new(AtomicBool::new(true));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone()).with_cancel(cancel);

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);
    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.source.fetch_count(), 0);
}

#[test]
fn cancel_mid_run_keeps_finished_work() {
    let h = harness(StubSource::new(&TEN), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());
    let progress = Recorder {
        cancel_at: Some((2, driver.cancel_flag())),
        ..Recorder::default()
    };

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &progress);
    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.applied, 3);
    assert_eq!(*progress.final_state.lock().unwrap(), Some(RunState::Cancelled));
    assert!(h.ledger.get(&series_tag(PRICES, Some("E2"))).is_some());
}

#[test]
fn unavailable_source_aborts_and_marks_the_rest_failed() {
    let source = StubSource::new(&TEN);
    *source.trip_after.lock().unwrap() = Some(3);
    let h = harness(source, d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.failures.len(), 7);
    assert!(summary
        .failures
        .iter()
        .all(|(_, msg)| msg.contains("circuit breaker")));
}

#[test]
fn explicit_entities_and_window() {
    let h = harness(StubSource::new(&TEN), d(2024, 1, 31));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone()).with_limits(1, 0.1);
    let window = TimeRange::between(d(2024, 1, 10), d(2024, 1, 12));

    let summary = driver.run(
        PRICES,
        Some(vec!["E1".into(), "E2".into()]),
        &RangePolicy::Explicit(window),
        &SilentProgress,
    );
    assert!(summary.all_succeeded());
    assert_eq!(summary.applied, 2);
    assert_eq!(h.source.last_call().unwrap().1, Some(window));

    let rec = h.ledger.get(&series_tag(PRICES, Some("E2"))).unwrap();
    assert_eq!(rec.since, Some(d(2024, 1, 10)));
    assert_eq!(rec.until, Some(d(2024, 1, 12)));
}

#[test]
fn none_policy_fetches_without_a_window() {
    let h = harness(StubSource::new(&["E0"]), d(2024, 1, 31));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());

    let summary = driver.run(PRICES, None, &RangePolicy::None, &SilentProgress);
    assert!(summary.all_succeeded());
    assert_eq!(h.source.last_call().unwrap().1, None);
}

#[test]
fn rerun_is_a_sweep_of_noops() {
    let h = harness(StubSource::new(&TEN), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());
    assert!(driver
        .run(PRICES, None, &RangePolicy::Auto, &SilentProgress)
        .all_succeeded());
    assert_eq!(h.source.fetch_count(), 10);

    let again = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);
    assert!(again.all_succeeded());
    assert_eq!(again.applied, 10);
    assert_eq!(h.source.fetch_count(), 10);

    let forced = driver.run(PRICES, None, &RangePolicy::Force, &SilentProgress);
    assert!(forced.all_succeeded());
    assert_eq!(h.source.fetch_count(), 20);
}

#[test]
fn unkeyed_series_runs_once() {
    let h = harness(StubSource::new(&[]), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());

    let summary = driver.run(CALENDAR, None, &RangePolicy::Auto, &SilentProgress);
    assert!(summary.all_succeeded());
    assert_eq!(summary.total, 1);
    assert!(h
        .ledger
        .get(&series_tag(CALENDAR, None))
        .and_then(|r| r.last_refreshed)
        .is_some());
}

#[test]
fn unknown_series_aborts_immediately() {
    let h = harness(StubSource::new(&[]), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());
    let summary = driver.run("Nope.Series", None, &RangePolicy::Auto, &SilentProgress);
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.attempted, 0);
}

#[test]
fn cancel_request_only_stops_one_run() {
    let h = harness(StubSource::new(&TEN), d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(h.orchestrator.clone());
    driver.cancel_flag().store(true, Ordering::SeqCst);

    let first = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);
    assert_eq!(first.state, RunState::Cancelled);
    assert!(!driver.cancel_flag().load(Ordering::SeqCst));

    let second = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);
    assert!(second.all_succeeded());
    assert_eq!(second.applied, 10);
}

/// Memory store whose upserts are slow and counted, and which refuses
/// rows for one entity.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    upserts: AtomicUsize,
    reject: Option<&'static str>,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            upserts: AtomicUsize::new(0),
            reject: None,
        }
    }
}

impl DocumentStore for SlowStore {
    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[String]>,
    ) -> Result<Option<TableFrame>, DataError> {
        self.inner.query(collection, filter, fields)
    }

    fn upsert(
        &self,
        collection: &str,
        frame: &TableFrame,
        keys: &[String],
    ) -> Result<bool, DataError> {
        std::thread::sleep(self.delay);
        if let (Some(code), Ok(col)) = (self.reject, frame.column("code")) {
            if frame::text_values(col)?.iter().flatten().any(|v| v == code) {
                return Err(DataError::Storage(format!("disk full for {code}")));
            }
        }
        let merged = self.inner.upsert(collection, frame, keys);
        self.upserts.fetch_add(1, Ordering::SeqCst);
        merged
    }

    fn range_of(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DataError> {
        self.inner.range_of(collection, field, filter)
    }

    fn distinct_values(&self, collection: &str, field: &str) -> Result<Vec<String>, DataError> {
        self.inner.distinct_values(collection, field)
    }
}

/// Tracks the most fetched patches seen waiting on persistence.
struct InFlight {
    source: Arc<StubSource>,
    store: Arc<SlowStore>,
    peak: AtomicUsize,
}

impl UpdateProgress for InFlight {
    fn on_start(&self, _entity: &str, _index: usize, _total: usize) {}

    fn on_complete(
        &self,
        _entity: &str,
        _index: usize,
        _total: usize,
        _result: &Result<usize, String>,
    ) {
        let pending = self.source.fetch_count() - self.store.upserts.load(Ordering::SeqCst);
        self.peak.fetch_max(pending, Ordering::SeqCst);
    }

    fn on_batch_complete(&self, _summary: &UpdateSummary) {}
}

#[test]
fn window_of_one_never_fetches_ahead_of_persistence() {
    let source = Arc::new(StubSource::new(&TEN));
    let store = Arc::new(SlowStore::new(Duration::from_millis(20)));
    let ledger = Arc::new(CoverageLedger::in_memory());
    let orchestrator = orchestrator_over(&source, store.clone(), &ledger, d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(orchestrator).with_limits(1, 0.1);
    let progress = InFlight {
        source: source.clone(),
        store: store.clone(),
        peak: AtomicUsize::new(0),
    };

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &progress);

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.applied, 10);
    assert_eq!(store.upserts.load(Ordering::SeqCst), 10);
    assert_eq!(progress.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn apply_failure_is_reported_under_its_own_entity() {
    let source = Arc::new(StubSource::new(&TEN).fail_for(&["E6"]));
    let store = Arc::new(SlowStore {
        reject: Some("E5"),
        ..SlowStore::new(Duration::from_millis(30))
    });
    let ledger = Arc::new(CoverageLedger::in_memory());
    let orchestrator = orchestrator_over(&source, store, &ledger, d(2024, 1, 5));
    let driver = BatchUpdateDriver::new(orchestrator).with_limits(4, 0.1);

    let summary = driver.run(PRICES, None, &RangePolicy::Auto, &SilentProgress);

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.applied, 8);
    let message = |entity: &str| {
        summary
            .failures
            .iter()
            .find(|(e, _)| e == entity)
            .map(|(_, m)| m.clone())
            .unwrap()
    };
    assert!(message("E5").contains("disk full for E5"), "{}", message("E5"));
    assert!(message("E6").contains("no route to E6"), "{}", message("E6"));
    assert!(ledger.get(&series_tag(PRICES, Some("E5"))).is_none());
}
