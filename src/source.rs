//! Change sources feed raw records to the merge engine
pub mod file;
pub mod kafka;
pub mod memory;

use async_trait::async_trait;

use crate::{error::SourceError, record::RawRecord, watermark::Watermark};

/// Finite, retryable sequence of raw records for one entity.
///
/// Delivery is at-least-once: nothing handed out by [`read_since`] counts as
/// consumed until [`acknowledge`] is called, which only happens after the
/// merged watermark is durable. A source whose read position moves on
/// regardless (a Kafka consumer) relies on the runner replaying the batch.
///
/// [`read_since`]: ChangeSource::read_since
/// [`acknowledge`]: ChangeSource::acknowledge
#[async_trait]
pub trait ChangeSource: Send + Sync {
    fn get_name(&self) -> String;

    /// Next batch of records; sources that can query by time only return
    /// records later than `since`, others may return older ones too
    async fn read_since(&mut self, since: Watermark) -> Result<Vec<RawRecord>, SourceError>;

    /// Whether reads are positioned by event time. Sources that keep their
    /// own cursor (offsets) return `false`, and their records are merged
    /// without the watermark filter: an older event time does not mean the
    /// record was already merged.
    fn filters_by_time(&self) -> bool {
        true
    }

    /// Messages of the last batch that could not be decoded and were skipped
    fn undecodable(&self) -> usize {
        0
    }

    /// Marks the last batch as processed
    async fn acknowledge(&mut self) -> Result<(), SourceError>;
}
