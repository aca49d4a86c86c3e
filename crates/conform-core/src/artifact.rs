//! Run directory layout and atomic JSON artifact writes.
//!
//! Every orchestration run gets a fresh directory under
//! `<workspace>/runs/<run_id>/`; nothing inside it is shared with other runs.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conform_state::{ContentDigest, RunId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{ConformError, ConformResult};

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> ConformResult<()> {
    let mut content = serde_json::to_vec_pretty(value)?;
    content.push(b'\n');
    write_bytes_atomic(path, &content)
}

/// Atomically replace `path` with `data`: temp file in the same directory, then rename.
pub fn write_bytes_atomic(path: &Path, data: &[u8]) -> ConformResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ConformError::io(dir, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| ConformError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| ConformError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| ConformError::io(path, e.error))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> ConformResult<T> {
    let bytes = std::fs::read(path).map_err(|e| ConformError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Metadata written to `run.json` when a run is prepared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub rulebook_path: PathBuf,
    pub rulebook_digest: ContentDigest,
    pub ground_truth_digest: ContentDigest,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Paths inside one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Layout for `run_id` under `<workspace>/runs/`.
    pub fn new(workspace: &Path, run_id: &RunId) -> Self {
        Self {
            root: runs_dir(workspace).join(run_id.as_str()),
        }
    }

    /// Create every directory of the layout.
    pub fn create(&self) -> ConformResult<()> {
        for dir in [
            self.answer_keys_dir(),
            self.blank_tests_dir(),
            self.logs_dir(),
            self.transcripts_dir(),
            self.grades_dir(),
            self.reports_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| ConformError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn answer_keys_dir(&self) -> PathBuf {
        self.root.join("answer-keys")
    }

    pub fn blank_tests_dir(&self) -> PathBuf {
        self.root.join("blank-tests")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, substrate: &str) -> PathBuf {
        self.logs_dir().join(format!("{substrate}.log"))
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.root.join("transcripts")
    }

    pub fn transcript_path(&self, substrate: &str) -> PathBuf {
        self.transcripts_dir().join(format!("{substrate}.jsonl"))
    }

    pub fn grades_dir(&self) -> PathBuf {
        self.root.join("grades")
    }

    pub fn grade_path(&self, substrate: &str) -> PathBuf {
        self.grades_dir().join(format!("{substrate}.json"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn substrate_report_path(&self, substrate: &str) -> PathBuf {
        self.reports_dir().join(format!("{substrate}.md"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn aggregate_report_path(&self) -> PathBuf {
        self.root.join("all-tests-results.md")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }
}

pub fn runs_dir(workspace: &Path) -> PathBuf {
    workspace.join("runs")
}

/// Point `<workspace>/runs/LATEST` at `run_id`.
pub fn mark_latest(workspace: &Path, run_id: &RunId) -> ConformResult<()> {
    let path = runs_dir(workspace).join("LATEST");
    write_bytes_atomic(&path, format!("{run_id}\n").as_bytes())
}

/// Run id recorded in `<workspace>/runs/LATEST`, if any.
pub fn latest_run(workspace: &Path) -> ConformResult<Option<RunId>> {
    let path = runs_dir(workspace).join("LATEST");
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => Ok(Some(RunId(s.trim().to_string()))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConformError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back["a"], 2);
    }

    #[test]
    fn latest_pointer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_run(dir.path()).unwrap(), None);
        let id = RunId("20261019T000000Z-deadbeef".into());
        mark_latest(dir.path(), &id).unwrap();
        assert_eq!(latest_run(dir.path()).unwrap(), Some(id));
    }

    #[test]
    fn layout_paths() {
        let layout = RunLayout::new(Path::new("/ws"), &RunId("r1".into()));
        assert_eq!(layout.root(), Path::new("/ws/runs/r1"));
        assert_eq!(layout.log_path("python"), Path::new("/ws/runs/r1/logs/python.log"));
        assert_eq!(
            layout.transcript_path("english"),
            Path::new("/ws/runs/r1/transcripts/english.jsonl")
        );
    }
}
