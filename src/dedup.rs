//! Latest-wins deduplication of raw records
use std::collections::{btree_map::Entry, BTreeMap};

use crate::record::RawRecord;

/// Folds records into one winner per natural key.
///
/// Each key keeps the record with the highest precedence, so the result does
/// not depend on input order. Keys come back sorted.
pub fn latest_per_key<I>(records: I) -> BTreeMap<String, RawRecord>
where
    I: IntoIterator<Item = RawRecord>,
{
    records.into_iter().fold(BTreeMap::new(), |mut acc, record| {
        match acc.entry(record.natural_key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.precedence() > slot.get().precedence() {
                    slot.insert(record);
                }
            }
        }
        acc
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::record::Payload;

    fn status(s: &str) -> Payload {
        json!({ "status": s }).as_object().cloned().unwrap()
    }

    #[test]
    fn keeps_latest_event_per_key() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let records = vec![
            RawRecord::upsert("TX1", t1 + Duration::minutes(2), status("settled")),
            RawRecord::upsert("TX2", t1, status("pending")),
            RawRecord::upsert("TX1", t1, status("pending")),
            RawRecord::upsert("TX1", t1 + Duration::minutes(1), status("authorized")),
        ];
        let winners = latest_per_key(records);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners["TX1"].payload, status("settled"));
        assert_eq!(winners["TX2"].payload, status("pending"));
    }

    #[test]
    fn tie_break_is_independent_of_arrival_order() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let a = RawRecord::upsert("A1", t, status("frozen"));
        let b = RawRecord::upsert("A1", t, status("active"));
        let forward = latest_per_key(vec![a.clone(), b.clone()]);
        let backward = latest_per_key(vec![b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward["A1"].payload, status("frozen"));
    }

    #[test]
    fn higher_sequence_wins_at_same_time() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let winners = latest_per_key(vec![
            RawRecord::upsert("C1", t, status("z")).with_sequence(10),
            RawRecord::upsert("C1", t, status("a")).with_sequence(11),
        ]);
        assert_eq!(winners["C1"].sequence, 11);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(latest_per_key(Vec::new()).is_empty());
    }
}
