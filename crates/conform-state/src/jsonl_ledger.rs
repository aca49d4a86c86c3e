//! Newline-delimited JSON ledger backend
//!
//! One entry per line, appended with a single write followed by
//! `sync_data`. A torn final line (crash mid-append) is skipped with a
//! warning when reading and cut off before the next append; corruption
//! anywhere else is an error.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{LedgerEntry, RunLedger};

/// File-backed ledger at `<workspace>/ledger.jsonl`.
#[derive(Debug)]
pub struct JsonlRunLedger {
    path: PathBuf,
    /// Serializes appends from concurrently running substrates
    write_lock: Mutex<()>,
}

impl JsonlRunLedger {
    /// Open (or lazily create) a ledger file. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Ledger at the conventional location inside a workspace directory.
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("ledger.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut the file back to its last complete line if an earlier append
    /// was interrupted mid-write.
    async fn trim_torn_tail(&self) -> LedgerResult<()> {
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_err(e)),
        };
        let len = file.metadata().await.map_err(|e| self.io_err(e))?.len();
        if len == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::End(-1))
            .await
            .map_err(|e| self.io_err(e))?;
        if file.read_u8().await.map_err(|e| self.io_err(e))? == b'\n' {
            return Ok(());
        }

        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1) as u64;
        warn!(
            ledger = %self.path.display(),
            dropped_bytes = len - keep,
            "truncating torn ledger tail"
        );
        file.set_len(keep).await.map_err(|e| self.io_err(e))?;
        file.sync_data().await.map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl RunLedger for JsonlRunLedger {
    async fn append(&self, entry: LedgerEntry) -> LedgerResult<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        self.trim_torn_tail().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        file.sync_data().await.map_err(|e| self.io_err(e))?;

        debug!(
            substrate = %entry.substrate,
            run_id = %entry.run_id,
            outcome = entry.outcome.label(),
            "ledger entry appended"
        );
        Ok(())
    }

    async fn entries(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        parse_lines(&content)
    }
}

fn parse_lines(content: &str) -> LedgerResult<Vec<LedgerEntry>> {
    let lines: Vec<&str> = content.lines().collect();
    let last_index = lines.len().saturating_sub(1);
    let torn_tail = !content.ends_with('\n');

    let mut entries = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if idx == last_index && torn_tail => {
                warn!(line = idx + 1, error = %e, "skipping torn ledger tail");
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: idx + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_has_no_entries() {
        assert!(parse_lines("").unwrap().is_empty());
        assert!(parse_lines("\n\n").unwrap().is_empty());
    }

    #[test]
    fn corrupt_middle_line_is_error() {
        let err = parse_lines("{not json}\n{}\n").unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn torn_tail_is_skipped() {
        assert!(parse_lines("{\"run_id\":").unwrap().is_empty());
    }
}
