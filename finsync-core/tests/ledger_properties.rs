//! Property tests for the coverage ledger.
//!
//! 1. Monotonicity: `since` never increases, `until` never decreases, for
//!    any sequence of extend calls in any order
//! 2. Durability: a reopened ledger reports exactly what was written
//! 3. Concurrency: racing writers on one tag keep the extreme values

use std::sync::Arc;

use chrono::NaiveDate;
use proptest::prelude::*;

use finsync_core::ledger::{tag_path, CoverageLedger};

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..20_000).prop_map(|d| {
        NaiveDate::from_ymd_opt(1980, 1, 1).unwrap() + chrono::Duration::days(d)
    })
}

#[derive(Debug, Clone)]
enum Op {
    Since(NaiveDate),
    Until(NaiveDate),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![arb_date().prop_map(Op::Since), arb_date().prop_map(Op::Until)]
}

// ── 1. Monotonicity ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn since_non_increasing_until_non_decreasing(ops in prop::collection::vec(arb_op(), 1..60)) {
        let ledger = CoverageLedger::in_memory();
        let tag = tag_path(&["Market", "DailyBar", "SPY"]);
        let mut prev_since: Option<NaiveDate> = None;
        let mut prev_until: Option<NaiveDate> = None;

        for op in &ops {
            match op {
                Op::Since(t) => ledger.extend_since(&tag, *t).unwrap(),
                Op::Until(t) => ledger.extend_until(&tag, *t).unwrap(),
            }
            let rec = ledger.get(&tag).unwrap();
            if let (Some(prev), Some(now)) = (prev_since, rec.since) {
                prop_assert!(now <= prev);
            }
            if let (Some(prev), Some(now)) = (prev_until, rec.until) {
                prop_assert!(now >= prev);
            }
            prev_since = rec.since.or(prev_since);
            prev_until = rec.until.or(prev_until);
        }

        let min_since = ops
            .iter()
            .filter_map(|o| match o { Op::Since(t) => Some(*t), _ => None })
            .min();
        let max_until = ops
            .iter()
            .filter_map(|o| match o { Op::Until(t) => Some(*t), _ => None })
            .max();
        let rec = ledger.get(&tag).unwrap();
        prop_assert_eq!(rec.since, min_since);
        prop_assert_eq!(rec.until, max_until);
    }
}

// ── 2. Durability ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reopen_replays_same_state(ops in prop::collection::vec(arb_op(), 1..20)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let tag = tag_path(&["Finance", "BalanceSheet", "000001"]);

        let expected = {
            let ledger = CoverageLedger::open(&path).unwrap();
            for op in &ops {
                match op {
                    Op::Since(t) => ledger.extend_since(&tag, *t).unwrap(),
                    Op::Until(t) => ledger.extend_until(&tag, *t).unwrap(),
                }
            }
            ledger.get(&tag)
        };

        let reopened = CoverageLedger::open(&path).unwrap();
        prop_assert_eq!(reopened.get(&tag), expected);
    }
}

// ── 3. Concurrency ───────────────────────────────────────────────────

#[test]
fn concurrent_writers_keep_extremes() {
    let ledger = Arc::new(CoverageLedger::in_memory());
    let tag = tag_path(&["Market", "SecuritiesInfo"]);
    let base = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let ledger = Arc::clone(&ledger);
            let tag = tag.clone();
            std::thread::spawn(move || {
                for i in 0..50i64 {
                    let offset = chrono::Duration::days(worker * 50 + i);
                    ledger.extend_since(&tag, base + offset).unwrap();
                    ledger.extend_until(&tag, base + offset).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let rec = ledger.get(&tag).unwrap();
    assert_eq!(rec.since, Some(base));
    assert_eq!(rec.until, Some(base + chrono::Duration::days(399)));
}

#[test]
fn scenario_since_widens_backward_only() {
    let ledger = CoverageLedger::in_memory();
    let tag = tag_path(&["Market", "SecuritiesInfo"]);
    for (y, m, d) in [(2020, 1, 1), (2019, 6, 1), (2021, 1, 1)] {
        ledger
            .extend_since(&tag, NaiveDate::from_ymd_opt(y, m, d).unwrap())
            .unwrap();
    }
    assert_eq!(
        ledger.get(&tag).unwrap().since,
        NaiveDate::from_ymd_opt(2019, 6, 1)
    );
}
