//! Kafka (Debezium) change source
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    Message, Offset, TopicPartitionList,
};
use tracing::{debug, warn};

use super::ChangeSource;
use crate::{decoder::Decoder, error::SourceError, record::RawRecord, watermark::Watermark};

/// Consumes one topic with a consumer group, committing offsets only when
/// the batch is acknowledged.
///
/// Kafka cannot be queried by event time: offsets are the cursor, and
/// `read_since` returns the next messages after the consumer's position.
/// The position moves on even when a batch is never acknowledged, so a failed
/// batch must be replayed by the caller, not re-read.
pub struct KafkaSource {
    consumer: StreamConsumer,
    decoder: Arc<dyn Decoder + Send + Sync>,
    batch_size: usize,
    batch_timeout: Duration,
    pending: Option<TopicPartitionList>,
    undecodable: usize,
}

impl KafkaSource {
    pub fn new(
        broker: &str,
        topic: &str,
        group: &str,
        decoder: Arc<dyn Decoder + Send + Sync>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(KafkaSource {
            consumer,
            decoder,
            batch_size,
            batch_timeout,
            pending: None,
            undecodable: 0,
        })
    }
}

#[async_trait]
impl ChangeSource for KafkaSource {
    fn get_name(&self) -> String {
        format!("kafka:{}", self.decoder.get_name())
    }

    async fn read_since(&mut self, _since: Watermark) -> Result<Vec<RawRecord>, SourceError> {
        let mut batch = Vec::new();
        self.undecodable = 0;
        let mut topic_map: HashMap<(String, i32), Offset> = HashMap::new();
        while batch.len() < self.batch_size {
            match tokio::time::timeout(self.batch_timeout, self.consumer.recv()).await {
                Err(_) => {
                    break;
                }
                Ok(Err(e)) => {
                    if batch.is_empty() {
                        return Err(e.into());
                    }
                    warn!("error receiving message: {e}");
                    break;
                }
                Ok(Ok(msg)) => {
                    let k = (msg.topic().to_string(), msg.partition());
                    // commit the _next_ offset, see rdkafka Consumer::commit
                    let next_offset = msg.offset() + 1;
                    let newer = match topic_map.get(&k).and_then(|o| o.to_raw()) {
                        Some(offset) => offset < next_offset,
                        None => true,
                    };
                    if newer {
                        topic_map.insert(k, Offset::from_raw(next_offset));
                    }
                    // tombstones follow deletes for log compaction and carry nothing
                    let Some(payload) = msg.payload() else {
                        continue;
                    };
                    match self.decoder.decode(payload) {
                        Ok(record) => batch.push(record),
                        Err(err) => {
                            self.undecodable += 1;
                            warn!(
                                topic = msg.topic(),
                                partition = msg.partition(),
                                offset = msg.offset(),
                                "skipping undecodable message: {err:#}"
                            );
                        }
                    }
                }
            }
        }
        let tpl = TopicPartitionList::from_topic_map(&topic_map)?;
        debug!(records = batch.len(), partitions = tpl.count(), "received kafka batch");
        self.pending = Some(tpl);
        Ok(batch)
    }

    fn filters_by_time(&self) -> bool {
        false
    }

    fn undecodable(&self) -> usize {
        self.undecodable
    }

    async fn acknowledge(&mut self) -> Result<(), SourceError> {
        match self.pending.take() {
            Some(tpl) if tpl.count() > 0 => self
                .consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| SourceError::Commit(e.to_string())),
            _ => Ok(()),
        }
    }
}
