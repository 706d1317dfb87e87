//! Property-based tests for merge invariants.
//!
//! These tests use proptest to check, over randomly generated change
//! batches, that:
//! - the current state of every key is its highest-precedence record
//! - merging a batch a second time changes nothing
//! - the returned watermark is exactly the highest admitted event time
//! - SCD2 history stays a set of ordered, non-overlapping intervals with at
//!   most one current version per key

#![allow(clippy::unwrap_used)]

use std::{collections::BTreeMap, time::Duration};

use bankmerge::{
    merge::{HistoryMode, LateArrivalPolicy, LoadMode, MergeEngine, MergeOptions},
    record::{ChangeOp, Payload, RawRecord, TargetRow},
    store::{memory::MemoryStore, TargetStore},
    watermark::Watermark,
};
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute)
}

/// Generates a change on one of a handful of keys.
fn arb_record() -> impl Strategy<Value = RawRecord> {
    (
        prop::sample::select(vec!["A1", "A2", "A3", "A4"]),
        0i64..30,      // event time, minutes
        0u64..3,       // sequence
        0u8..4,        // value
        prop::bool::weighted(0.15),
    )
        .prop_map(|(key, minute, seq, value, delete)| {
            let record = if delete {
                RawRecord::delete(key, at(minute))
            } else {
                let mut p = Payload::new();
                p.insert("balance".into(), json!(value));
                RawRecord::upsert(key, at(minute), p)
            };
            record.with_sequence(seq)
        })
}

fn arb_batch() -> impl Strategy<Value = Vec<RawRecord>> {
    prop::collection::vec(arb_record(), 0..25)
}

fn engine(history: HistoryMode, load_mode: LoadMode) -> MergeEngine {
    MergeEngine::new(MergeOptions {
        history,
        load_mode,
        late_arrival: LateArrivalPolicy::Backfill,
        retry_backoff: Duration::ZERO,
        ..Default::default()
    })
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

fn winners(batch: &[RawRecord]) -> BTreeMap<String, RawRecord> {
    let mut out: BTreeMap<String, RawRecord> = BTreeMap::new();
    for r in batch {
        match out.get(&r.natural_key) {
            Some(w) if w.precedence() >= r.precedence() => {}
            _ => {
                out.insert(r.natural_key.clone(), r.clone());
            }
        }
    }
    out
}

/// Checks interval ordering and the single-current-version rule for one key
fn check_history(rows: &[TargetRow]) -> Result<(), String> {
    let spans: Vec<_> = rows
        .iter()
        .map(|r| r.validity.ok_or("history row without validity"))
        .collect::<Result<_, _>>()?;
    if spans.iter().filter(|v| v.is_current).count() > 1 {
        return Err(format!("several current rows: {spans:?}"));
    }
    for (i, v) in spans.iter().enumerate() {
        match v.valid_to {
            Some(to) if to <= v.valid_from => return Err(format!("empty interval {v:?}")),
            Some(_) if v.is_current => return Err(format!("closed current row {v:?}")),
            None if !v.is_current => return Err(format!("open historical row {v:?}")),
            _ => {}
        }
        if let Some(next) = spans.get(i + 1) {
            match v.valid_to {
                Some(to) if to <= next.valid_from => {}
                _ => return Err(format!("overlapping intervals {v:?} and {next:?}")),
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn current_state_is_latest_record(batch in arb_batch(), scd2 in any::<bool>()) {
        let history = if scd2 { HistoryMode::Scd2 } else { HistoryMode::Overwrite };
        let store = MemoryStore::new();
        let engine = engine(history, LoadMode::Incremental);
        let expected = winners(&batch);
        let current = block_on(async {
            engine.merge_batch(&store, batch, Watermark::BEGINNING).await.unwrap();
            store.list_current().await.unwrap()
        });

        let current: BTreeMap<String, Payload> = current
            .into_iter()
            .map(|r| (r.natural_key, r.payload))
            .collect();
        let want: BTreeMap<String, Payload> = expected
            .into_iter()
            .filter(|(_, r)| r.op == ChangeOp::Upsert)
            .map(|(k, r)| (k, r.payload))
            .collect();
        prop_assert_eq!(current, want);
    }

    #[test]
    fn merging_twice_changes_nothing(batch in arb_batch(), scd2 in any::<bool>()) {
        let history = if scd2 { HistoryMode::Scd2 } else { HistoryMode::Overwrite };
        let store = MemoryStore::new();
        let engine = engine(history, LoadMode::Full);
        let (first, second, before, after) = block_on(async {
            let first = engine.merge_batch(&store, batch.clone(), Watermark::BEGINNING).await.unwrap();
            let before = store.snapshot().await;
            let second = engine.merge_batch(&store, batch, first.watermark).await.unwrap();
            (first, second, before, store.snapshot().await)
        });
        prop_assert!(second.is_noop());
        prop_assert_eq!(second.watermark, first.watermark);
        prop_assert_eq!(before, after);
    }

    #[test]
    fn watermark_is_highest_admitted_time(batch in arb_batch(), prior in 0i64..30) {
        let store = MemoryStore::new();
        let engine = engine(HistoryMode::Overwrite, LoadMode::Incremental);
        let prior = Watermark::at(at(prior));
        let want = batch
            .iter()
            .map(|r| r.event_time)
            .filter(|t| prior.admits(*t))
            .fold(prior, Watermark::advance);
        let out = block_on(engine.merge_batch(&store, batch, prior)).unwrap();
        prop_assert!(out.watermark >= prior);
        prop_assert_eq!(out.watermark, want);
    }

    #[test]
    fn history_stays_well_formed(batches in prop::collection::vec(arb_batch(), 1..5)) {
        let store = MemoryStore::new();
        let engine = engine(HistoryMode::Scd2, LoadMode::Full);
        let rows = block_on(async {
            let mut watermark = Watermark::BEGINNING;
            for batch in batches {
                watermark = engine.merge_batch(&store, batch, watermark).await.unwrap().watermark;
            }
            store.snapshot().await
        });

        let mut by_key: BTreeMap<String, Vec<TargetRow>> = BTreeMap::new();
        for row in rows {
            by_key.entry(row.natural_key.clone()).or_default().push(row);
        }
        for (key, rows) in by_key {
            if let Err(e) = check_history(&rows) {
                prop_assert!(false, "{}: {}", key, e);
            }
        }
    }
}
