//! Manages decoders
pub mod avro;
pub mod debezium;
pub mod json;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::record::{ChangeOp, Payload, RawRecord};

/// Confluent [header](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format) length
pub const CONFLUENT_HEADER_LEN: usize = 5;

/// Decoder converts binary message from the change source into a raw record
pub trait Decoder {
    fn get_name(&self) -> String;
    fn decode(&self, message: &[u8]) -> Result<RawRecord, anyhow::Error>;
}

/// Creates decoder of specified name.
/// If you add your own decoders, register them here
pub fn get_decoder(
    name: &str,
    decoder_settings: Option<toml::Value>,
) -> Result<Arc<dyn Decoder + Send + Sync>, anyhow::Error> {
    let settings = decoder_settings.ok_or_else(|| anyhow!("{name} decoder config missing"));
    match name {
        "json" => Ok(Arc::new(json::Decoder::new(settings?.try_into()?))),
        "debezium" => Ok(Arc::new(debezium::Decoder::new(settings?.try_into()?))),
        "avro" => Ok(Arc::new(avro::new(settings?.try_into()?)?)),
        _ => Err(anyhow!("unknown decoder {}", name)),
    }
}

/// Maps fields of a decoded row onto raw record attributes
#[derive(Debug, Clone, Deserialize)]
pub struct Fields {
    /// field holding the natural key
    pub key_field: String,
    /// field holding the event time (RFC 3339, `YYYY-MM-DD HH:MM:SS` or epoch millis)
    pub time_field: String,
    /// optional tie-breaker for records sharing an event time
    pub sequence_field: Option<String>,
    /// optional boolean field marking deleted rows, dropped from the payload
    pub deleted_field: Option<String>,
}

impl Fields {
    pub fn extract(&self, mut payload: Payload) -> Result<RawRecord> {
        let natural_key = payload
            .get(&self.key_field)
            .and_then(key_string)
            .ok_or_else(|| anyhow!("missing key field {}", self.key_field))?;
        let event_time = payload
            .get(&self.time_field)
            .ok_or_else(|| anyhow!("missing time field {}", self.time_field))
            .and_then(parse_time)
            .with_context(|| format!("field {}", self.time_field))?;
        let sequence = match &self.sequence_field {
            Some(f) => payload.get(f).and_then(Value::as_u64).unwrap_or(0),
            None => 0,
        };
        let deleted = match &self.deleted_field {
            Some(f) => payload.remove(f).map_or(false, |v| is_truthy(&v)),
            None => false,
        };
        Ok(RawRecord {
            natural_key,
            event_time,
            sequence,
            op: if deleted { ChangeOp::Delete } else { ChangeOp::Upsert },
            payload,
        })
    }
}

pub(crate) fn key_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

/// Parses an event time from RFC 3339, a naive UTC timestamp or epoch milliseconds
pub fn parse_time(v: &Value) -> Result<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").map(|t| t.and_utc()))
            .map_err(|e| anyhow!("bad timestamp {s:?}: {e}")),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| anyhow!("bad epoch millis {n}")),
        _ => Err(anyhow!("unexpected timestamp {v}")),
    }
}
