//! Watermarks bound incremental reads from a change source.
//!
//! A watermark is the highest `event_time` durably merged into a target. It is
//! passed into the merge engine and returned from it as a plain value; the
//! [`WatermarkStore`] only sees it after a run's writes have succeeded.
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::WatermarkError;

/// Highest merged event time; `BEGINNING` sorts before every instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub const BEGINNING: Watermark = Watermark(None);

    pub fn at(t: DateTime<Utc>) -> Self {
        Watermark(Some(t))
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// whether an event at `t` has not been merged yet
    pub fn admits(&self, t: DateTime<Utc>) -> bool {
        self.0.map_or(true, |w| t > w)
    }

    /// Moves forward to `t`, never backwards
    pub fn advance(self, t: DateTime<Utc>) -> Self {
        self.max(Watermark::at(t))
    }
}

impl From<Option<DateTime<Utc>>> for Watermark {
    fn from(t: Option<DateTime<Utc>>) -> Self {
        Watermark(t)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(f, "{}", t.to_rfc3339()),
            None => write!(f, "beginning"),
        }
    }
}

/// Durable per-entity watermark storage
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Last committed watermark, `None` if the entity never committed one
    async fn load(&self, entity: &str) -> Result<Option<Watermark>, WatermarkError>;

    /// Persists `watermark`; must fail rather than move a committed watermark back
    async fn commit(&self, entity: &str, watermark: Watermark) -> Result<(), WatermarkError>;
}

#[derive(Serialize, Deserialize)]
struct WatermarkFile {
    entity: String,
    watermark: Watermark,
    committed_at: DateTime<Utc>,
}

/// Stores one JSON file per entity under a directory.
///
/// Writes go to a temp file that is renamed over the old one, so a crash
/// leaves either the old or the new watermark, never a torn file.
pub struct FileWatermarkStore {
    dir: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        FileWatermarkStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, entity: &str) -> PathBuf {
        self.dir.join(format!("{entity}.json"))
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self, entity: &str) -> Result<Option<Watermark>, WatermarkError> {
        let io_err = |source| WatermarkError::Io {
            entity: entity.to_owned(),
            source,
        };
        let data = match tokio::fs::read(self.path(entity)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        let file: WatermarkFile = serde_json::from_slice(&data).map_err(|source| WatermarkError::Format {
            entity: entity.to_owned(),
            source,
        })?;
        Ok(Some(file.watermark))
    }

    async fn commit(&self, entity: &str, watermark: Watermark) -> Result<(), WatermarkError> {
        if let Some(committed) = self.load(entity).await? {
            if watermark < committed {
                return Err(WatermarkError::Regression {
                    entity: entity.to_owned(),
                    committed,
                    requested: watermark,
                });
            }
        }
        let io_err = |source| WatermarkError::Io {
            entity: entity.to_owned(),
            source,
        };
        let file = WatermarkFile {
            entity: entity.to_owned(),
            watermark,
            committed_at: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|source| WatermarkError::Format {
            entity: entity.to_owned(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp = self.dir.join(format!(".{entity}.json.tmp"));
        tokio::fs::write(&tmp, data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, self.path(entity)).await.map_err(io_err)?;
        Ok(())
    }
}

/// Process-local watermarks, lost on exit
#[derive(Default)]
pub struct MemoryWatermarkStore {
    marks: Mutex<HashMap<String, Watermark>>,
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self, entity: &str) -> Result<Option<Watermark>, WatermarkError> {
        Ok(self.marks.lock().await.get(entity).copied())
    }

    async fn commit(&self, entity: &str, watermark: Watermark) -> Result<(), WatermarkError> {
        let mut marks = self.marks.lock().await;
        if let Some(&committed) = marks.get(entity) {
            if watermark < committed {
                return Err(WatermarkError::Regression {
                    entity: entity.to_owned(),
                    committed,
                    requested: watermark,
                });
            }
        }
        marks.insert(entity.to_owned(), watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn beginning_admits_everything() {
        let t = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert!(Watermark::BEGINNING.admits(t));
        assert!(Watermark::BEGINNING < Watermark::at(t));
    }

    #[test]
    fn admits_only_strictly_later_events() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let w = Watermark::at(t);
        assert!(!w.admits(t));
        assert!(w.admits(t + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn advance_never_moves_back() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let w = Watermark::at(t);
        assert_eq!(w.advance(t - chrono::Duration::days(1)), w);
        assert_eq!(w.advance(t + chrono::Duration::days(1)).time(), Some(t + chrono::Duration::days(1)));
    }

    #[tokio::test]
    async fn file_store_round_trips_and_refuses_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path());
        assert_eq!(store.load("accounts").await.unwrap(), None);

        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store.commit("accounts", Watermark::at(t)).await.unwrap();
        assert_eq!(store.load("accounts").await.unwrap(), Some(Watermark::at(t)));

        let err = store
            .commit("accounts", Watermark::at(t - chrono::Duration::seconds(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WatermarkError::Regression { .. }));
        assert_eq!(store.load("accounts").await.unwrap(), Some(Watermark::at(t)));
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("customers.json"), b"not json").unwrap();
        let store = FileWatermarkStore::new(dir.path());
        assert!(matches!(
            store.load("customers").await,
            Err(WatermarkError::Format { .. })
        ));
    }
}
