//! Newline-delimited snapshot files, one encoded message per line
use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::warn;

use super::ChangeSource;
use crate::{decoder::Decoder, error::SourceError, record::RawRecord, watermark::Watermark};

pub struct FileSource {
    path: PathBuf,
    decoder: Arc<dyn Decoder + Send + Sync>,
    undecodable: usize,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, decoder: Arc<dyn Decoder + Send + Sync>) -> Self {
        FileSource {
            path: path.into(),
            decoder,
            undecodable: 0,
        }
    }
}

#[async_trait]
impl ChangeSource for FileSource {
    fn get_name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn read_since(&mut self, since: Watermark) -> Result<Vec<RawRecord>, SourceError> {
        let data = tokio::fs::read(&self.path).await?;
        let mut records = Vec::new();
        let (mut decoded, mut last_err) = (0, None);
        self.undecodable = 0;
        for (n, line) in data.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match self.decoder.decode(line) {
                Ok(r) => {
                    decoded += 1;
                    if since.admits(r.event_time) {
                        records.push(r);
                    }
                }
                Err(e) => {
                    warn!(line = n + 1, decoder = %self.decoder.get_name(), "failed to decode message: {e:#}");
                    self.undecodable += 1;
                    last_err = Some(e);
                }
            }
        }
        // not a single good line: most likely the wrong decoder
        match last_err {
            Some(e) if decoded == 0 => Err(SourceError::Decode(format!("{}: {e:#}", self.path.display()))),
            _ => Ok(records),
        }
    }

    fn undecodable(&self) -> usize {
        self.undecodable
    }

    async fn acknowledge(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
