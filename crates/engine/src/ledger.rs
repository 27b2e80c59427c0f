//! Checkpoint ledger
//!
//! Newline-delimited entity ids of completed mutations, append-only. The set of
//! ids in the file is what a later run treats as already done.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::model::normalize_entity_id;

/// Append-only record of successfully mutated entity ids
#[derive(Debug)]
pub struct CheckpointLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every completed id; a missing file is an empty set
    pub async fn load(&self) -> Result<HashSet<String>, LedgerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint ledger yet");
                return Ok(HashSet::new());
            }
            Err(e) => return Err(LedgerError::new(&self.path, e)),
        };

        let ids: HashSet<String> = contents
            .lines()
            .filter_map(normalize_entity_id)
            .map(str::to_string)
            .collect();
        info!(path = %self.path.display(), completed = ids.len(), "Loaded checkpoint ledger");
        Ok(ids)
    }

    /// Append ids, one per line, and flush before returning
    ///
    /// Ids are written in normalized form; ids that cannot be normalized are
    /// skipped. Concurrent callers are serialized. A torn final line left by a
    /// crash is terminated first so the new ids start on their own lines.
    pub async fn append_batch(&self, ids: &[String]) -> Result<(), LedgerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .await
            .map_err(|e| LedgerError::new(&self.path, e))?;

        let mut buf = String::with_capacity(ids.iter().map(|id| id.len() + 1).sum::<usize>() + 1);
        if !self
            .ends_with_newline(&mut file)
            .await
            .map_err(|e| LedgerError::new(&self.path, e))?
        {
            buf.push('\n');
        }
        let mut written = 0;
        for raw in ids {
            let Some(id) = normalize_entity_id(raw) else {
                warn!(entity_id = ?raw, "Not checkpointing unrepresentable entity_id");
                continue;
            };
            buf.push_str(id);
            buf.push('\n');
            written += 1;
        }
        if written == 0 {
            return Ok(());
        }

        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| LedgerError::new(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| LedgerError::new(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| LedgerError::new(&self.path, e))?;

        debug!(appended = written, "Checkpoint batch flushed");
        Ok(())
    }

    /// True for an empty file or one ending in `\n`
    async fn ends_with_newline(&self, file: &mut tokio::fs::File) -> std::io::Result<bool> {
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(true);
        }
        file.seek(SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        Ok(last[0] == b'\n')
    }
}
