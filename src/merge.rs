//! Incremental upsert-merge with latest-wins deduplication.
//!
//! A batch is filtered against the prior watermark, folded to one winner per
//! natural key, and each winner is planned against the key's stored rows.
//! Plans are applied one key at a time; a failed key aborts the batch before
//! the caller can advance the watermark, and replaying the batch converges
//! to the same state.
use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    dedup,
    error::{MergeError, StoreError},
    record::{ChangeOp, RawRecord, TargetRow, Validity},
    store::{KeyWrite, TargetStore},
    watermark::Watermark,
};

const WRITE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// skip records at or below the prior watermark
    #[default]
    Incremental,
    /// consider every record, e.g. for an initial load or a rebuild
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// one row per key, overwritten in place
    #[default]
    Overwrite,
    /// SCD Type-2: closed historical rows plus one current row per key
    Scd2,
}

/// What to do with an SCD2 record older than the key's current version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateArrivalPolicy {
    #[default]
    Ignore,
    /// drop and report in [`MergeOutcome::rejected`]
    Reject,
    /// insert into history at its proper position
    Backfill,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub load_mode: LoadMode,
    pub history: HistoryMode,
    pub late_arrival: LateArrivalPolicy,
    /// extra attempts for transient store errors, per key
    pub write_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            load_mode: LoadMode::default(),
            history: HistoryMode::default(),
            late_arrival: LateArrivalPolicy::default(),
            write_retries: 3,
            retry_backoff: WRITE_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// rows inserted, overwritten or closed
    pub touched: Vec<TargetRow>,
    /// keys hard-deleted from the target
    pub deleted: Vec<String>,
    /// late arrivals refused under [`LateArrivalPolicy::Reject`]
    pub rejected: Vec<RawRecord>,
    /// winners that needed no write (stale, unchanged or ignored)
    pub skipped: usize,
    pub watermark: Watermark,
}

impl MergeOutcome {
    fn unchanged(watermark: Watermark) -> Self {
        MergeOutcome {
            watermark,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.touched.is_empty() && self.deleted.is_empty()
    }

    fn record_write(&mut self, write: KeyWrite) {
        if write.purge {
            self.deleted.push(write.natural_key);
        }
        self.touched.extend(write.upserts);
    }
}

/// Result of merging a single record
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Written(KeyWrite),
    Skipped,
    Rejected,
}

#[derive(Debug)]
enum Plan {
    Write(KeyWrite),
    Skip,
    Reject,
}

pub struct MergeEngine {
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(options: MergeOptions) -> Self {
        MergeEngine { options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub async fn merge_batch(
        &self,
        store: &dyn TargetStore,
        records: Vec<RawRecord>,
        prior: Watermark,
    ) -> Result<MergeOutcome, MergeError> {
        self.merge_batch_at(store, records, prior, Utc::now()).await
    }

    /// Merges `records` into `store`, stamping written rows with `now`.
    ///
    /// The returned watermark is the highest event time considered, or
    /// `prior` when nothing passed the filter. It never moves backwards.
    pub async fn merge_batch_at(
        &self,
        store: &dyn TargetStore,
        records: Vec<RawRecord>,
        prior: Watermark,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, MergeError> {
        let filter = self.options.load_mode == LoadMode::Incremental;
        self.merge(store, records, prior, now, filter).await
    }

    /// Merges a batch from a source positioned by its own cursor (offsets):
    /// records are never dropped for being at or below `prior`, since
    /// the cursor already guarantees they were not merged. Stale records
    /// still lose against stored rows by precedence.
    pub async fn merge_unfiltered(
        &self,
        store: &dyn TargetStore,
        records: Vec<RawRecord>,
        prior: Watermark,
    ) -> Result<MergeOutcome, MergeError> {
        self.merge(store, records, prior, Utc::now(), false).await
    }

    async fn merge(
        &self,
        store: &dyn TargetStore,
        records: Vec<RawRecord>,
        prior: Watermark,
        now: DateTime<Utc>,
        filter: bool,
    ) -> Result<MergeOutcome, MergeError> {
        let received = records.len();
        let considered: Vec<RawRecord> = if filter {
            records
                .into_iter()
                .filter(|r| prior.admits(r.event_time))
                .collect()
        } else {
            records
        };
        let watermark = considered
            .iter()
            .map(|r| r.event_time)
            .fold(prior, Watermark::advance);
        let mut outcome = MergeOutcome::unchanged(watermark);

        let winners = dedup::latest_per_key(considered);
        debug!(
            received,
            winners = winners.len(),
            %prior,
            %watermark,
            "deduplicated batch"
        );
        if winners.is_empty() {
            return Ok(outcome);
        }

        let keys: Vec<String> = winners.keys().cloned().collect();
        let mut existing = self
            .with_retries("read", || store.rows_for(&keys))
            .await
            .map_err(MergeError::StoreRead)?;

        let mut written = 0;
        for (key, record) in winners {
            let rows = existing.remove(&key).unwrap_or_default();
            match self.plan(&rows, &record, now) {
                Plan::Skip => outcome.skipped += 1,
                Plan::Reject => {
                    warn!(key = %key, event_time = %record.event_time, "rejected late arrival");
                    outcome.rejected.push(record);
                }
                Plan::Write(write) => {
                    self.with_retries("write", || store.apply(write.clone()))
                        .await
                        .map_err(|source| MergeError::StoreWrite {
                            key: key.clone(),
                            written,
                            source,
                        })?;
                    written += 1;
                    outcome.record_write(write);
                }
            }
        }
        Ok(outcome)
    }

    /// Merges one record through the same rules as a batch, ignoring watermarks
    pub async fn apply_record(
        &self,
        store: &dyn TargetStore,
        record: RawRecord,
        now: DateTime<Utc>,
    ) -> Result<Applied, MergeError> {
        let keys = [record.natural_key.clone()];
        let rows = self
            .with_retries("read", || store.rows_for(&keys))
            .await
            .map_err(MergeError::StoreRead)?
            .remove(&record.natural_key)
            .unwrap_or_default();
        match self.plan(&rows, &record, now) {
            Plan::Skip => Ok(Applied::Skipped),
            Plan::Reject => Ok(Applied::Rejected),
            Plan::Write(write) => {
                self.with_retries("write", || store.apply(write.clone()))
                    .await
                    .map_err(|source| MergeError::StoreWrite {
                        key: record.natural_key.clone(),
                        written: 0,
                        source,
                    })?;
                Ok(Applied::Written(write))
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.options.write_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "retrying target {what}");
                    sleep(self.options.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn plan(&self, rows: &[TargetRow], record: &RawRecord, now: DateTime<Utc>) -> Plan {
        match self.options.history {
            HistoryMode::Overwrite => plan_overwrite(rows, record, now),
            HistoryMode::Scd2 => self.plan_scd2(rows, record, now),
        }
    }

    fn plan_scd2(&self, rows: &[TargetRow], record: &RawRecord, now: DateTime<Utc>) -> Plan {
        let key = &record.natural_key;
        let t = record.event_time;
        let Some(latest) = rows.last() else {
            return match record.op {
                ChangeOp::Delete => Plan::Skip,
                ChangeOp::Upsert => Plan::Write(KeyWrite::upsert(key, vec![open(record, now)])),
            };
        };

        let Some(current) = rows.iter().find(|r| r.is_current()) else {
            // deleted key: only a change after the deletion reopens it
            let deleted_at = latest.validity.and_then(|v| v.valid_to).unwrap_or(latest.event_time);
            return match record.op {
                ChangeOp::Delete => Plan::Skip,
                ChangeOp::Upsert if t >= deleted_at => {
                    Plan::Write(KeyWrite::upsert(key, vec![open(record, now)]))
                }
                ChangeOp::Upsert => self.late(rows, record, now),
            };
        };

        let from = valid_from(current);
        if t > from {
            match record.op {
                ChangeOp::Delete => Plan::Write(KeyWrite::upsert(key, vec![close(current, t, now)])),
                ChangeOp::Upsert if record.payload == current.payload => Plan::Skip,
                ChangeOp::Upsert => Plan::Write(KeyWrite::upsert(
                    key,
                    vec![close(current, t, now), open(record, now)],
                )),
            }
        } else if t == from {
            match record.op {
                _ if record.precedence() <= current.precedence() => Plan::Skip,
                // closing at its own start would leave an empty interval
                ChangeOp::Delete => self.late(rows, record, now),
                ChangeOp::Upsert if record.payload == current.payload => Plan::Skip,
                ChangeOp::Upsert => Plan::Write(KeyWrite::upsert(key, vec![open(record, now)])),
            }
        } else {
            self.late(rows, record, now)
        }
    }

    fn late(&self, rows: &[TargetRow], record: &RawRecord, now: DateTime<Utc>) -> Plan {
        match (self.options.late_arrival, record.op) {
            (LateArrivalPolicy::Ignore, _) => {
                debug!(key = %record.natural_key, event_time = %record.event_time, "ignoring late arrival");
                Plan::Skip
            }
            (LateArrivalPolicy::Reject, _) | (LateArrivalPolicy::Backfill, ChangeOp::Delete) => Plan::Reject,
            (LateArrivalPolicy::Backfill, ChangeOp::Upsert) => backfill(rows, record, now),
        }
    }
}

fn plan_overwrite(rows: &[TargetRow], record: &RawRecord, now: DateTime<Utc>) -> Plan {
    let existing = rows.iter().find(|r| r.is_current());
    match (record.op, existing) {
        (_, Some(row)) if record.precedence() <= row.precedence() => Plan::Skip,
        (ChangeOp::Delete, None) => Plan::Skip,
        (ChangeOp::Delete, Some(_)) => Plan::Write(KeyWrite::purge(&record.natural_key)),
        (ChangeOp::Upsert, _) => Plan::Write(KeyWrite::upsert(
            &record.natural_key,
            vec![TargetRow::from_record(record, now, None)],
        )),
    }
}

/// Places a late upsert into closed history.
///
/// Splits the version covering `event_time`, or fills the gap before the next
/// version when none covers it. Matching payloads are left alone.
fn backfill(rows: &[TargetRow], record: &RawRecord, now: DateTime<Utc>) -> Plan {
    let key = &record.natural_key;
    let t = record.event_time;
    let covering = rows
        .iter()
        .filter_map(|r| r.validity.map(|v| (r, v)))
        .find(|(_, v)| v.covers(t));

    if let Some((row, v)) = covering {
        if record.payload == row.payload || (v.valid_from == t && record.precedence() <= row.precedence()) {
            return Plan::Skip;
        }
        if v.valid_from == t {
            return Plan::Write(KeyWrite::upsert(
                key,
                vec![TargetRow::from_record(record, now, Some(v))],
            ));
        }
        let mut head = row.clone();
        head.validity = Some(Validity::closed(v.valid_from, t));
        head.load_timestamp = now;
        let tail = TargetRow::from_record(
            record,
            now,
            Some(Validity {
                valid_from: t,
                valid_to: v.valid_to,
                is_current: v.is_current,
            }),
        );
        return Plan::Write(KeyWrite::upsert(key, vec![head, tail]));
    }

    let next = rows
        .iter()
        .filter(|r| r.slot().map_or(false, |from| from > t))
        .min_by_key(|r| r.slot());
    match next {
        Some(next) if next.payload == record.payload => Plan::Skip,
        Some(next) => Plan::Write(KeyWrite::upsert(
            key,
            vec![TargetRow::from_record(
                record,
                now,
                Some(Validity::closed(t, valid_from(next))),
            )],
        )),
        None => Plan::Skip,
    }
}

fn valid_from(row: &TargetRow) -> DateTime<Utc> {
    row.validity.map_or(row.event_time, |v| v.valid_from)
}

fn open(record: &RawRecord, now: DateTime<Utc>) -> TargetRow {
    TargetRow::from_record(record, now, Some(Validity::open(record.event_time)))
}

fn close(current: &TargetRow, at: DateTime<Utc>, now: DateTime<Utc>) -> TargetRow {
    let mut row = current.clone();
    row.validity = Some(Validity::closed(valid_from(current), at));
    row.load_timestamp = now;
    row
}
