use crate::record::{Payload, RawRecord};

use super::Fields;

/// Decodes flat JSON rows, e.g. `{"customer_id": "C1", "email": "...", "updated_at": "..."}`
pub struct Decoder {
    fields: Fields,
}

impl Decoder {
    pub fn new(fields: Fields) -> Self {
        Decoder { fields }
    }
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("json")
    }
    fn decode(&self, message: &[u8]) -> Result<RawRecord, anyhow::Error> {
        let row: Payload = serde_json::from_slice(message)?;
        self.fields.extract(row)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Decoder as _;
    use super::*;

    #[test]
    fn decodes_flat_row() {
        let decoder = Decoder::new(Fields {
            key_field: "customer_id".into(),
            time_field: "updated_at".into(),
            sequence_field: None,
            deleted_field: None,
        });
        let rec = decoder
            .decode(br#"{"customer_id":"C7","email":"c7@bank.io","updated_at":"2024-04-01 10:00:00"}"#)
            .unwrap();
        assert_eq!(rec.natural_key, "C7");
        assert_eq!(rec.payload["email"], "c7@bank.io");
    }

    #[test]
    fn rejects_non_objects() {
        let decoder = Decoder::new(Fields {
            key_field: "id".into(),
            time_field: "ts".into(),
            sequence_field: None,
            deleted_field: None,
        });
        assert!(decoder.decode(b"[1,2,3]").is_err());
    }
}
