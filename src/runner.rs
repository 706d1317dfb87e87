//! Per-entity merge pipeline: source -> merge engine -> target, plus watermark
use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    error::RunError,
    merge::MergeEngine,
    record::RawRecord,
    source::ChangeSource,
    store::TargetStore,
    watermark::{Watermark, WatermarkStore},
};

const SOURCE_BACKOFF: Duration = Duration::from_secs(1);

/// Summary of one successful run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub received: usize,
    /// messages the source skipped because they could not be decoded
    pub undecodable: usize,
    pub touched: usize,
    pub deleted: usize,
    pub rejected: usize,
    pub prior: Watermark,
    pub watermark: Watermark,
    /// whether the batch was left over from a failed run
    pub replayed: bool,
}

/// Batch read from the source but not acknowledged yet
struct Unacked {
    records: Vec<RawRecord>,
    undecodable: usize,
}

pub struct Runner {
    entity: String,
    source: Box<dyn ChangeSource>,
    store: Arc<dyn TargetStore>,
    watermarks: Arc<dyn WatermarkStore>,
    engine: MergeEngine,
    source_retries: u32,
    source_backoff: Duration,
    unacked: Option<Unacked>,
}

impl Runner {
    pub fn new(
        entity: impl Into<String>,
        source: Box<dyn ChangeSource>,
        store: Arc<dyn TargetStore>,
        watermarks: Arc<dyn WatermarkStore>,
        engine: MergeEngine,
    ) -> Self {
        Runner {
            entity: entity.into(),
            source,
            store,
            watermarks,
            engine,
            source_retries: 3,
            source_backoff: SOURCE_BACKOFF,
            unacked: None,
        }
    }

    pub fn with_source_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.source_retries = retries;
        self.source_backoff = backoff;
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Runs forever, one merge every `interval`; failures are logged and the
    /// next tick retries from the last committed watermark
    pub async fn start(&mut self, interval: Duration) {
        loop {
            if let Err(e) = self.run_once().await {
                error!(entity = %self.entity, "merge run failed: {e}");
            }
            sleep(interval).await;
        }
    }

    /// One merge run.
    ///
    /// The watermark is committed only after every write of the batch went
    /// through, and the source is acknowledged only after that. Until then
    /// the batch is kept and the next run merges it again instead of reading,
    /// since a consumer's position has already moved past it.
    pub async fn run_once(&mut self) -> Result<RunReport, RunError> {
        let prior = self
            .watermarks
            .load(&self.entity)
            .await
            .map_err(RunError::WatermarkLoad)?
            .unwrap_or(Watermark::BEGINNING);

        let replayed = self.unacked.is_some();
        let batch = match self.unacked.take() {
            Some(batch) => {
                info!(
                    entity = %self.entity,
                    records = batch.records.len(),
                    "replaying unacknowledged batch"
                );
                batch
            }
            None => {
                let records = self.read(prior).await?;
                Unacked {
                    records,
                    undecodable: self.source.undecodable(),
                }
            }
        };
        let received = batch.records.len();
        let undecodable = batch.undecodable;
        let records = batch.records.clone();
        self.unacked = Some(batch);

        let outcome = if self.source.filters_by_time() {
            self.engine.merge_batch(self.store.as_ref(), records, prior).await?
        } else {
            self.engine
                .merge_unfiltered(self.store.as_ref(), records, prior)
                .await?
        };

        if outcome.watermark > prior {
            self.watermarks
                .commit(&self.entity, outcome.watermark)
                .await
                .map_err(RunError::WatermarkPersist)?;
        }
        self.unacked = None;
        if let Err(e) = self.source.acknowledge().await {
            // redelivered records lose to the merged rows by precedence
            warn!(entity = %self.entity, "failed to acknowledge source: {e}");
        }

        let report = RunReport {
            received,
            undecodable,
            touched: outcome.touched.len(),
            deleted: outcome.deleted.len(),
            rejected: outcome.rejected.len(),
            prior,
            watermark: outcome.watermark,
            replayed,
        };
        if undecodable > 0 {
            warn!(entity = %self.entity, undecodable, "skipped undecodable messages");
        }
        info!(
            entity = %self.entity,
            received,
            touched = report.touched,
            deleted = report.deleted,
            rejected = report.rejected,
            skipped = outcome.skipped,
            watermark = %report.watermark,
            "merge run complete"
        );
        Ok(report)
    }

    async fn read(&mut self, since: Watermark) -> Result<Vec<RawRecord>, RunError> {
        let mut attempt = 0;
        loop {
            match self.source.read_since(since).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transient() && attempt < self.source_retries => {
                    attempt += 1;
                    warn!(
                        entity = %self.entity,
                        source = %self.source.get_name(),
                        attempt,
                        "retrying source read: {e}"
                    );
                    sleep(self.source_backoff).await;
                }
                Err(e) => return Err(RunError::SourceRead(e)),
            }
        }
    }
}
