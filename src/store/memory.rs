//! In-process target store
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyWrite, TargetStore};
use crate::{
    error::StoreError,
    record::{by_slot, TargetRow},
};

/// Keeps rows in a map keyed by natural key; each write holds the lock for
/// the whole key, which makes it atomic
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<String, Vec<TargetRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, ordered by key then slot
    pub async fn snapshot(&self) -> Vec<TargetRow> {
        self.rows.read().await.values().flatten().cloned().collect()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn rows_for(&self, keys: &[String]) -> Result<HashMap<String, Vec<TargetRow>>, StoreError> {
        let rows = self.rows.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn list_current(&self) -> Result<Vec<TargetRow>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .flat_map(|r| r.iter().filter(|row| row.is_current()).cloned())
            .collect())
    }

    async fn apply(&self, write: KeyWrite) -> Result<(), StoreError> {
        if let Some(stray) = write.upserts.iter().find(|r| r.natural_key != write.natural_key) {
            return Err(StoreError::Conflict {
                reason: format!("row for {} in key write", stray.natural_key),
                key: write.natural_key,
            });
        }
        let mut rows = self.rows.write().await;
        let mut versions = if write.purge {
            Vec::new()
        } else {
            rows.remove(&write.natural_key).unwrap_or_default()
        };
        for row in write.upserts {
            match versions.iter_mut().find(|v| v.slot() == row.slot()) {
                Some(existing) => *existing = row,
                None => versions.push(row),
            }
        }
        versions.sort_by(by_slot);
        if versions.is_empty() {
            rows.remove(&write.natural_key);
        } else {
            rows.insert(write.natural_key, versions);
        }
        Ok(())
    }
}
