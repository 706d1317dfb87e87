//! Generic decoder for Confluent-framed Avro records
use std::{io::BufReader, time::Duration};

use anyhow::anyhow;
use apache_avro::{from_avro_datum, types::Value, Schema};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::{Number, Value as JsonValue};

use super::{Fields, CONFLUENT_HEADER_LEN};
use crate::record::{Payload, RawRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// path to the writer schema (`.avsc`)
    pub schema_file: String,
    #[serde(flatten)]
    pub fields: Fields,
}

pub struct Decoder {
    schema: Schema,
    fields: Fields,
}

pub fn new(settings: Settings) -> Result<Decoder, anyhow::Error> {
    let schema = std::fs::read_to_string(&settings.schema_file)
        .map_err(|e| anyhow!("reading schema {}: {e}", settings.schema_file))?;
    from_schema(&schema, settings.fields)
}

pub fn from_schema(schema: &str, fields: Fields) -> Result<Decoder, anyhow::Error> {
    Ok(Decoder {
        schema: Schema::parse_str(schema)?,
        fields,
    })
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("avro")
    }

    fn decode(&self, message: &[u8]) -> Result<RawRecord, anyhow::Error> {
        if message.len() <= CONFLUENT_HEADER_LEN {
            return Err(anyhow!("message shorter than confluent header"));
        }
        let mut datum = BufReader::new(&message[CONFLUENT_HEADER_LEN..]);
        let record = match from_avro_datum(&self.schema, &mut datum, None)? {
            Value::Record(x) => x,
            _ => return Err(anyhow!("avro message must be a record")),
        };
        let mut row = Payload::new();
        for (column, value) in record {
            let v = avro2json(value).map_err(|e| anyhow!("column {column}: {e}"))?;
            row.insert(column, v);
        }
        self.fields.extract(row)
    }
}

fn avro2json(v: Value) -> Result<JsonValue, anyhow::Error> {
    match v {
        Value::Null => Ok(JsonValue::Null),
        Value::Boolean(x) => Ok(JsonValue::from(x)),
        Value::Int(x) => Ok(JsonValue::from(x)),
        Value::Long(x) => Ok(JsonValue::from(x)),
        Value::Float(x) => float(x as f64),
        Value::Double(x) => float(x),
        Value::Bytes(x) | Value::Fixed(_, x) => Ok(JsonValue::from(String::from_utf8_lossy(&x).into_owned())),
        Value::String(x) => Ok(JsonValue::from(x)),
        Value::Enum(_, y) => Ok(JsonValue::from(y)),
        Value::Union(_, x) => avro2json(*x),
        Value::Array(x) => x.into_iter().map(avro2json).collect::<Result<Vec<_>, _>>().map(JsonValue::from),
        Value::Map(x) => {
            let mut m = serde_json::Map::new();
            for (k, v) in x {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Record(x) => {
            let mut m = serde_json::Map::new();
            for (k, v) in x {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Date(x) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(x as i64)))
            .map(|d| JsonValue::from(d.to_string()))
            .ok_or_else(|| anyhow!("date out of range: {x}")),
        Value::TimeMillis(x) => Ok(JsonValue::from(x)),
        Value::TimeMicros(x) => Ok(JsonValue::from(x)),
        Value::TimestampMillis(x) | Value::LocalTimestampMillis(x) => DateTime::from_timestamp_millis(x)
            .map(|t| JsonValue::from(t.to_rfc3339()))
            .ok_or_else(|| anyhow!("timestamp out of range: {x}")),
        Value::TimestampMicros(x) | Value::LocalTimestampMicros(x) => DateTime::from_timestamp_micros(x)
            .map(|t| JsonValue::from(t.to_rfc3339()))
            .ok_or_else(|| anyhow!("timestamp out of range: {x}")),
        Value::Duration(x) => {
            let duration = Duration::from_millis(u32::from(x.millis()) as u64)
                + Duration::from_secs(86400 * u32::from(x.days()) as u64)
                + Duration::from_secs(30 * 86400 * u32::from(x.months()) as u64);
            Ok(JsonValue::from(duration.as_millis() as u64))
        }
        Value::Uuid(x) => Ok(JsonValue::from(x.to_string())),
        Value::Decimal(_) => Err(anyhow!("unsupported decimal type")),
        #[allow(unreachable_patterns)]
        _ => Err(anyhow!("unsupported avro type")),
    }
}

/// JSON has no NaN or infinities
fn float(x: f64) -> Result<JsonValue, anyhow::Error> {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .ok_or_else(|| anyhow!("non-finite double {x}"))
}

#[cfg(test)]
mod tests {
    use apache_avro::to_avro_datum;

    use super::super::Decoder as _;
    use super::*;

    const SCHEMA: &str = r#"
    {
        "type": "record",
        "name": "account",
        "fields": [
            {"name": "account_id", "type": "string"},
            {"name": "balance", "type": "double"},
            {"name": "currency", "type": ["null", "string"]},
            {"name": "updated_at", "type": {"type": "long", "logicalType": "timestamp-millis"}}
        ]
    }"#;

    fn decoder() -> Decoder {
        from_schema(
            SCHEMA,
            Fields {
                key_field: "account_id".into(),
                time_field: "updated_at".into(),
                sequence_field: None,
                deleted_field: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn decodes_framed_record() {
        let d = decoder();
        let value = Value::Record(vec![
            ("account_id".into(), Value::String("A1".into())),
            ("balance".into(), Value::Double(99.5)),
            ("currency".into(), Value::Union(1, Box::new(Value::String("EUR".into())))),
            ("updated_at".into(), Value::TimestampMillis(1717200000000)),
        ]);
        let mut message = vec![0u8, 0, 0, 0, 1];
        message.extend(to_avro_datum(&d.schema, value).unwrap());

        let rec = d.decode(&message).unwrap();
        assert_eq!(rec.natural_key, "A1");
        assert_eq!(rec.payload["currency"], "EUR");
        assert_eq!(rec.event_time.timestamp_millis(), 1717200000000);
    }

    #[test]
    fn rejects_non_finite_doubles() {
        let d = decoder();
        let value = Value::Record(vec![
            ("account_id".into(), Value::String("A1".into())),
            ("balance".into(), Value::Double(f64::NAN)),
            ("currency".into(), Value::Union(0, Box::new(Value::Null))),
            ("updated_at".into(), Value::TimestampMillis(1717200000000)),
        ]);
        let mut message = vec![0u8, 0, 0, 0, 1];
        message.extend(to_avro_datum(&d.schema, value).unwrap());

        let err = d.decode(&message).unwrap_err().to_string();
        assert!(err.contains("column balance"), "{err}");
        assert!(err.contains("non-finite"), "{err}");
    }

    #[test]
    fn rejects_truncated_message() {
        assert!(decoder().decode(&[0, 0, 0]).is_err());
    }
}
