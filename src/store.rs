//! Target stores hold the merged state of an entity
pub mod clickhouse;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{error::StoreError, record::TargetRow};

/// All writes for one natural key, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWrite {
    pub natural_key: String,
    /// drop every existing row of the key before applying `upserts`
    pub purge: bool,
    /// rows to insert or replace, matched by [`TargetRow::slot`]
    pub upserts: Vec<TargetRow>,
}

impl KeyWrite {
    pub fn upsert(natural_key: impl Into<String>, upserts: Vec<TargetRow>) -> Self {
        KeyWrite {
            natural_key: natural_key.into(),
            purge: false,
            upserts,
        }
    }

    pub fn purge(natural_key: impl Into<String>) -> Self {
        KeyWrite {
            natural_key: natural_key.into(),
            purge: true,
            upserts: Vec::new(),
        }
    }
}

/// Queryable table with per-key atomic writes
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Every row (current and historical) of the given keys, ordered by slot.
    /// Keys without rows are absent from the map.
    async fn rows_for(&self, keys: &[String]) -> Result<HashMap<String, Vec<TargetRow>>, StoreError>;

    /// Current rows of every key, ordered by key
    async fn list_current(&self) -> Result<Vec<TargetRow>, StoreError>;

    async fn apply(&self, write: KeyWrite) -> Result<(), StoreError>;

    async fn current(&self, key: &str) -> Result<Option<TargetRow>, StoreError> {
        let mut rows = self.rows_for(&[key.to_owned()]).await?;
        Ok(rows
            .remove(key)
            .and_then(|rows| rows.into_iter().find(TargetRow::is_current)))
    }
}
