//! Raw change records and materialized target rows
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity field values, keys kept sorted so equal payloads serialize identically
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Kind of change carried by a raw record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    #[default]
    Upsert,
    Delete,
}

/// One observed state of an entity at a point in time.
///
/// The same `natural_key` shows up many times as the entity changes; the
/// record with the highest [`Precedence`] is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub natural_key: String,
    pub event_time: DateTime<Utc>,
    /// secondary ordering for records sharing an `event_time` (LSN, offset)
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub op: ChangeOp,
    #[serde(default)]
    pub payload: Payload,
}

impl RawRecord {
    pub fn upsert(natural_key: impl Into<String>, event_time: DateTime<Utc>, payload: Payload) -> Self {
        RawRecord {
            natural_key: natural_key.into(),
            event_time,
            sequence: 0,
            op: ChangeOp::Upsert,
            payload,
        }
    }

    pub fn delete(natural_key: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        RawRecord {
            natural_key: natural_key.into(),
            event_time,
            sequence: 0,
            op: ChangeOp::Delete,
            payload: Payload::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn precedence(&self) -> Precedence {
        Precedence::new(self.event_time, self.sequence, self.op, &self.payload)
    }
}

/// Total order used to pick the winning state of a key.
///
/// Compares `event_time`, then `sequence`, then op (a delete beats an upsert
/// at the same position), then the canonical JSON text of the payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence {
    event_time: DateTime<Utc>,
    sequence: u64,
    op: ChangeOp,
    tie_breaker: String,
}

impl Precedence {
    fn new(event_time: DateTime<Utc>, sequence: u64, op: ChangeOp, payload: &Payload) -> Self {
        Precedence {
            event_time,
            sequence,
            op,
            tie_breaker: canonical_json(payload),
        }
    }
}

pub fn canonical_json(payload: &Payload) -> String {
    serde_json::to_string(payload).unwrap_or_default()
}

/// SCD2 validity interval of a target row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl Validity {
    pub fn open(valid_from: DateTime<Utc>) -> Self {
        Validity {
            valid_from,
            valid_to: None,
            is_current: true,
        }
    }

    pub fn closed(valid_from: DateTime<Utc>, valid_to: DateTime<Utc>) -> Self {
        Validity {
            valid_from,
            valid_to: Some(valid_to),
            is_current: false,
        }
    }

    /// whether `t` falls inside `[valid_from, valid_to)`
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        self.valid_from <= t && self.valid_to.map_or(true, |end| t < end)
    }
}

/// Materialized state of an entity in a target table.
///
/// Overwrite tables hold one row per key with no `validity`. History tables
/// hold one row per version, keyed by `(natural_key, valid_from)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub natural_key: String,
    pub payload: Payload,
    pub event_time: DateTime<Utc>,
    pub sequence: u64,
    pub load_timestamp: DateTime<Utc>,
    pub validity: Option<Validity>,
}

impl TargetRow {
    pub fn from_record(record: &RawRecord, load_timestamp: DateTime<Utc>, validity: Option<Validity>) -> Self {
        TargetRow {
            natural_key: record.natural_key.clone(),
            payload: record.payload.clone(),
            event_time: record.event_time,
            sequence: record.sequence,
            load_timestamp,
            validity,
        }
    }

    pub fn is_current(&self) -> bool {
        self.validity.map_or(true, |v| v.is_current)
    }

    /// Row identity within its key: `valid_from` on history tables, `None` otherwise
    pub fn slot(&self) -> Option<DateTime<Utc>> {
        self.validity.map(|v| v.valid_from)
    }

    pub fn precedence(&self) -> Precedence {
        Precedence::new(self.event_time, self.sequence, ChangeOp::Upsert, &self.payload)
    }
}

/// Orders rows of one key by validity start; overwrite rows sort first
pub fn by_slot(a: &TargetRow, b: &TargetRow) -> Ordering {
    a.slot().cmp(&b.slot())
}
