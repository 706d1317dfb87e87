//! Debezium change event envelope, JSON converter with or without schemas
use anyhow::{anyhow, Context};
use serde::Deserialize;
use serde_json::Value;

use crate::record::{ChangeOp, Payload, RawRecord};

use super::{key_string, parse_time};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// column holding the natural key
    pub key_field: String,
    /// column to use as event time instead of the envelope's `ts_ms`
    pub time_field: Option<String>,
}

pub struct Decoder {
    settings: Settings,
}

impl Decoder {
    pub fn new(settings: Settings) -> Self {
        Decoder { settings }
    }

    fn event_time(&self, envelope: &Value, row: &Payload) -> Result<chrono::DateTime<chrono::Utc>, anyhow::Error> {
        if let Some(f) = &self.settings.time_field {
            let v = row.get(f).ok_or_else(|| anyhow!("missing time field {f}"))?;
            return parse_time(v).with_context(|| format!("field {f}"));
        }
        let ts = envelope
            .get("ts_ms")
            .or_else(|| envelope.pointer("/source/ts_ms"))
            .ok_or_else(|| anyhow!("envelope without ts_ms"))?;
        parse_time(ts)
    }
}

/// LSN for Postgres connectors, binlog position for MySQL
fn sequence(envelope: &Value) -> u64 {
    envelope
        .pointer("/source/lsn")
        .or_else(|| envelope.pointer("/source/pos"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("debezium")
    }

    fn decode(&self, message: &[u8]) -> Result<RawRecord, anyhow::Error> {
        let v: Value = serde_json::from_slice(message)?;
        let envelope = match v.get("payload") {
            Some(p) if v.get("schema").is_some() => p,
            _ => &v,
        };
        let op = match envelope.get("op").and_then(Value::as_str) {
            Some("c") | Some("u") | Some("r") => ChangeOp::Upsert,
            Some("d") => ChangeOp::Delete,
            Some(other) => return Err(anyhow!("unsupported debezium op {other:?}")),
            None => return Err(anyhow!("envelope without op")),
        };
        let image = match op {
            ChangeOp::Upsert => "after",
            ChangeOp::Delete => "before",
        };
        let row = envelope
            .get(image)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| anyhow!("envelope without {image} image"))?;
        let natural_key = row
            .get(&self.settings.key_field)
            .and_then(key_string)
            .ok_or_else(|| anyhow!("missing key field {}", self.settings.key_field))?;

        Ok(RawRecord {
            natural_key,
            event_time: self.event_time(envelope, &row)?,
            sequence: sequence(envelope),
            op,
            payload: match op {
                ChangeOp::Upsert => row,
                ChangeOp::Delete => Payload::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::super::Decoder as _;
    use super::*;

    fn decoder(time_field: Option<&str>) -> Decoder {
        Decoder::new(Settings {
            key_field: "transaction_id".into(),
            time_field: time_field.map(String::from),
        })
    }

    #[test]
    fn decodes_update_with_schema_wrapper() {
        let msg = br#"{
            "schema": {},
            "payload": {
                "before": {"transaction_id": "TX1", "status": "pending"},
                "after": {"transaction_id": "TX1", "status": "completed", "amount": 12.5},
                "source": {"lsn": 2448, "ts_ms": 1717200000000},
                "op": "u",
                "ts_ms": 1717200000123
            }
        }"#;
        let rec = decoder(None).decode(msg).unwrap();
        assert_eq!(rec.natural_key, "TX1");
        assert_eq!(rec.op, ChangeOp::Upsert);
        assert_eq!(rec.sequence, 2448);
        assert_eq!(rec.event_time, Utc.timestamp_millis_opt(1717200000123).unwrap());
        assert_eq!(rec.payload["status"], "completed");
    }

    #[test]
    fn decodes_delete_from_before_image() {
        let msg = br#"{"before": {"transaction_id": 77}, "after": null, "op": "d", "ts_ms": 1717200000000}"#;
        let rec = decoder(None).decode(msg).unwrap();
        assert_eq!(rec.natural_key, "77");
        assert_eq!(rec.op, ChangeOp::Delete);
        assert!(rec.payload.is_empty());
    }

    #[test]
    fn uses_row_column_as_event_time() {
        let msg = br#"{"after": {"transaction_id": "TX2", "transaction_time": "2024-06-01 08:30:00"}, "op": "c", "ts_ms": 1}"#;
        let rec = decoder(Some("transaction_time")).decode(msg).unwrap();
        assert_eq!(rec.event_time, Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap());
    }

    #[test]
    fn rejects_truncate_events() {
        let msg = br#"{"op": "t", "ts_ms": 1}"#;
        assert!(decoder(None).decode(msg).is_err());
    }
}
