//! ClickHouse target store.
//!
//! Rows live in a `ReplacingMergeTree` ordered by `(natural_key, slot_us)`:
//! writing a row with the same key and slot and a higher `version` replaces
//! it, and `is_deleted = 1` rows erase it. Every [`KeyWrite`] is sent as a
//! single insert block, which ClickHouse applies atomically. Reads use `FINAL`
//! so they see the collapsed state. Timestamps are stored as Int64
//! microseconds since the epoch.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse_rs::{types::Complex, Block, Pool};
use tracing::debug;

use super::{KeyWrite, TargetStore};
use crate::{
    error::StoreError,
    record::{canonical_json, Payload, TargetRow, Validity},
};

/// keys per `IN (...)` lookup
const KEY_CHUNK: usize = 1000;

const COLUMNS: &str =
    "natural_key, slot_us, payload, event_time_us, sequence, load_timestamp_us, valid_from_us, valid_to_us, is_current";

pub struct ClickHouseStore {
    pool: Pool,
    table: String,
    last_version: AtomicU64,
}

impl ClickHouseStore {
    pub fn new(url: &str, table: &str) -> Self {
        ClickHouseStore {
            pool: Pool::new(url),
            table: table.to_owned(),
            last_version: AtomicU64::new(0),
        }
    }

    /// Creates the target table if it does not exist yet
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        let mut ch = self.pool.get_handle().await?;
        ch.execute(create_table_sql(&self.table)).await?;
        Ok(())
    }

    async fn select(&self, filter: &str) -> Result<Vec<TargetRow>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} FINAL WHERE is_deleted = 0 AND {filter} ORDER BY natural_key, slot_us",
            self.table
        );
        let mut ch = self.pool.get_handle().await?;
        let block: Block<Complex> = ch.query(sql).fetch_all().await?;
        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let key: String = row.get("natural_key")?;
            let payload: String = row.get("payload")?;
            let valid_from: Option<i64> = row.get("valid_from_us")?;
            let valid_to: Option<i64> = row.get("valid_to_us")?;
            let is_current: u8 = row.get("is_current")?;
            let payload: Payload = serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: format!("payload: {e}"),
            })?;
            let validity = match valid_from {
                Some(from) => Some(Validity {
                    valid_from: from_micros(&key, from)?,
                    valid_to: valid_to.map(|t| from_micros(&key, t)).transpose()?,
                    is_current: is_current == 1,
                }),
                None => None,
            };
            rows.push(TargetRow {
                event_time: from_micros(&key, row.get("event_time_us")?)?,
                sequence: row.get("sequence")?,
                load_timestamp: from_micros(&key, row.get("load_timestamp_us")?)?,
                natural_key: key,
                payload,
                validity,
            });
        }
        Ok(rows)
    }

    /// One insert block; each row is paired with its `is_deleted` flag
    fn block(&self, rows: &[(&TargetRow, bool)]) -> Block {
        let version = next_version(&self.last_version);
        Block::new()
            .column("natural_key", rows.iter().map(|(r, _)| r.natural_key.clone()).collect::<Vec<_>>())
            .column("slot_us", rows.iter().map(|(r, _)| slot_micros(r)).collect::<Vec<_>>())
            .column("payload", rows.iter().map(|(r, _)| canonical_json(&r.payload)).collect::<Vec<_>>())
            .column("event_time_us", rows.iter().map(|(r, _)| r.event_time.timestamp_micros()).collect::<Vec<_>>())
            .column("sequence", rows.iter().map(|(r, _)| r.sequence).collect::<Vec<_>>())
            .column(
                "load_timestamp_us",
                rows.iter().map(|(r, _)| r.load_timestamp.timestamp_micros()).collect::<Vec<_>>(),
            )
            .column(
                "valid_from_us",
                rows.iter()
                    .map(|(r, _)| r.validity.map(|v| v.valid_from.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .column(
                "valid_to_us",
                rows.iter()
                    .map(|(r, _)| r.validity.and_then(|v| v.valid_to).map(|t| t.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .column("is_current", rows.iter().map(|(r, _)| r.is_current() as u8).collect::<Vec<_>>())
            .column("is_deleted", rows.iter().map(|(_, d)| *d as u8).collect::<Vec<_>>())
            .column("version", vec![version; rows.len()])
    }
}

#[async_trait]
impl TargetStore for ClickHouseStore {
    async fn rows_for(&self, keys: &[String]) -> Result<HashMap<String, Vec<TargetRow>>, StoreError> {
        let mut out: HashMap<String, Vec<TargetRow>> = HashMap::new();
        for chunk in keys.chunks(KEY_CHUNK) {
            for row in self.select(&key_filter(chunk)).await? {
                out.entry(row.natural_key.clone()).or_default().push(row);
            }
        }
        Ok(out)
    }

    async fn list_current(&self) -> Result<Vec<TargetRow>, StoreError> {
        self.select("is_current = 1").await
    }

    async fn apply(&self, write: KeyWrite) -> Result<(), StoreError> {
        let mut tombstones = Vec::new();
        if write.purge {
            let filter = key_filter(std::slice::from_ref(&write.natural_key));
            tombstones = self
                .select(&filter)
                .await?
                .into_iter()
                .filter(|old| write.upserts.iter().all(|new| new.slot() != old.slot()))
                .collect();
        }
        if tombstones.is_empty() && write.upserts.is_empty() {
            return Ok(());
        }

        // tombstones and re-inserts share one block so the key changes atomically
        let rows: Vec<(&TargetRow, bool)> = tombstones
            .iter()
            .map(|r| (r, true))
            .chain(write.upserts.iter().map(|r| (r, false)))
            .collect();
        let mut ch = self.pool.get_handle().await?;
        ch.insert(&self.table, self.block(&rows)).await?;
        debug!(
            table = %self.table,
            key = %write.natural_key,
            upserts = write.upserts.len(),
            purged = tombstones.len(),
            "applied key write"
        );
        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            natural_key String,
            slot_us Int64,
            payload String,
            event_time_us Int64,
            sequence UInt64,
            load_timestamp_us Int64,
            valid_from_us Nullable(Int64),
            valid_to_us Nullable(Int64),
            is_current UInt8,
            is_deleted UInt8,
            version UInt64
        ) ENGINE = ReplacingMergeTree(version, is_deleted)
        ORDER BY (natural_key, slot_us)"
    )
}

/// Strictly increasing row version, close to wall-clock microseconds
fn next_version(last_version: &AtomicU64) -> u64 {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let mut last = last_version.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match last_version.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn slot_micros(row: &TargetRow) -> i64 {
    row.slot().map_or(0, |t| t.timestamp_micros())
}

fn from_micros(key: &str, us: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| StoreError::Corrupt {
        key: key.to_owned(),
        reason: format!("timestamp out of range: {us}"),
    })
}

/// ClickHouse string literal
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn key_filter(keys: &[String]) -> String {
    let list: Vec<String> = keys.iter().map(|k| quote(k)).collect();
    format!("natural_key IN ({})", list.join(", "))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn quotes_string_literals() {
        assert_eq!(quote("A1"), "'A1'");
        assert_eq!(quote("O'Brien"), r"'O\'Brien'");
        assert_eq!(quote(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn builds_key_filter() {
        let keys = vec!["TX1".to_owned(), "TX'2".to_owned()];
        assert_eq!(key_filter(&keys), r"natural_key IN ('TX1', 'TX\'2')");
    }

    #[test]
    fn slot_is_zero_for_overwrite_rows() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut row = TargetRow {
            natural_key: "TX1".into(),
            payload: Payload::new(),
            event_time: t,
            sequence: 0,
            load_timestamp: t,
            validity: None,
        };
        assert_eq!(slot_micros(&row), 0);
        row.validity = Some(Validity::open(t));
        assert_eq!(slot_micros(&row), t.timestamp_micros());
    }

    #[test]
    fn versions_strictly_increase() {
        let last = AtomicU64::new(u64::MAX / 2);
        let a = next_version(&last);
        let b = next_version(&last);
        assert!(b > a);
    }

    #[test]
    fn table_is_replacing_merge_tree() {
        let ddl = create_table_sql("fact_transactions");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS fact_transactions"));
        assert!(ddl.contains("ReplacingMergeTree(version, is_deleted)"));
    }
}
