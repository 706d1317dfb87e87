use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::ChangeSource;
use crate::{error::SourceError, record::RawRecord, watermark::Watermark};

/// Append-only in-process change log, queryable by event time.
///
/// Clones share the same log, so a test can keep appending while a runner
/// owns the source.
#[derive(Clone, Default)]
pub struct MemorySource {
    log: Arc<Mutex<Vec<RawRecord>>>,
    failures: Arc<Mutex<u32>>,
}

impl MemorySource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        MemorySource {
            log: Arc::new(Mutex::new(records)),
            failures: Arc::default(),
        }
    }

    pub fn push(&self, record: RawRecord) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }

    /// Makes the next `n` reads fail with a transient error
    pub fn fail_next_reads(&self, n: u32) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    fn get_name(&self) -> String {
        String::from("memory")
    }

    async fn read_since(&mut self, since: Watermark) -> Result<Vec<RawRecord>, SourceError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(SourceError::Read("injected failure".into()));
            }
        }
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log.iter().filter(|r| since.admits(r.event_time)).cloned().collect())
    }

    async fn acknowledge(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
