//! Judge transcripts: one JSON line per query attempt, so disagreements can
//! be audited after the fact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{ConformError, ConformResult};

/// One judge query attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub substrate: String,
    pub judge: String,
    pub entity: String,
    pub key: String,
    pub field: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub prompt: String,
    /// Raw completion text, when one arrived
    pub response: Option<String>,
    /// Value extracted from the response
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Append-only JSONL transcript file.
#[derive(Debug)]
pub struct TranscriptWriter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl TranscriptWriter {
    /// Create (truncating) the transcript file.
    pub async fn create(path: &Path) -> ConformResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConformError::io(parent, e))?;
        }
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| ConformError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &TranscriptEntry) -> ConformResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| ConformError::io(&self.path, e))?;
        file.flush().await.map_err(|e| ConformError::io(&self.path, e))
    }
}

/// Read every entry of a transcript file.
pub fn read_transcript(path: &Path) -> ConformResult<Vec<TranscriptEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| ConformError::io(path, e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(ConformError::from))
        .collect()
}
