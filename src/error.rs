//! Error types for sources, stores, watermarks and merge runs
use thiserror::Error;

use crate::watermark::Watermark;

/// Failure reading from a change source
#[derive(Error, Debug)]
pub enum SourceError {
    /// Transient read failure, the whole batch may be re-read
    #[error("reading change source: {0}")]
    Read(String),

    #[error("decoding change record: {0}")]
    Decode(String),

    /// Failure acknowledging consumed records (offsets will be redelivered)
    #[error("acknowledging change source: {0}")]
    Commit(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Read(_) | SourceError::Commit(_))
    }
}

impl From<rdkafka::error::KafkaError> for SourceError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        SourceError::Read(e.to_string())
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Read(e.to_string())
    }
}

/// Failure talking to a target store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("target store unavailable: {0}")]
    Unavailable(String),

    #[error("write conflict on key {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error("corrupt row for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Unavailability and single-row conflicts are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict { .. })
    }
}

impl From<clickhouse_rs::errors::Error> for StoreError {
    fn from(e: clickhouse_rs::errors::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Failure loading or persisting a watermark
#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("watermark i/o for {entity}: {source}")]
    Io {
        entity: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed watermark for {entity}: {source}")]
    Format {
        entity: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("refusing to move watermark of {entity} back from {committed} to {requested}")]
    Regression {
        entity: String,
        committed: Watermark,
        requested: Watermark,
    },
}

/// Failure of a merge batch; the watermark must not be advanced
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("reading current target rows: {0}")]
    StoreRead(#[source] StoreError),

    #[error("writing key {key} (after {written} keys written): {source}")]
    StoreWrite {
        key: String,
        written: usize,
        #[source]
        source: StoreError,
    },
}

impl MergeError {
    pub fn into_store_error(self) -> StoreError {
        match self {
            MergeError::StoreRead(e) => e,
            MergeError::StoreWrite { source, .. } => source,
        }
    }
}

/// Failure of one scheduled run of an entity pipeline
#[derive(Error, Debug)]
pub enum RunError {
    #[error("source read failed: {0}")]
    SourceRead(#[from] SourceError),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("loading watermark: {0}")]
    WatermarkLoad(#[source] WatermarkError),

    #[error("persisting watermark: {0}")]
    WatermarkPersist(#[source] WatermarkError),
}
