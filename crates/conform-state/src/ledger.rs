//! Run ledger types and trait
//!
//! A ledger entry is written once per (substrate, run) pair, whatever the
//! outcome. Entries are never rewritten; "last run" and "last successful
//! run" are views computed over the history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{LedgerError, LedgerResult};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// Used to fingerprint the rulebook and the derived ground truth so a
/// ledger entry can say exactly what a score was measured against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = LedgerError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LedgerError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one conformance run.
///
/// Format: `<UTC timestamp>-<8 hex>`, e.g. `20261019T141503Z-3f9a0c1d`.
/// Lexicographic order matches creation order to the second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new run id stamped with the current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Generate a run id for a given instant.
    pub fn at(when: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("{}-{}", when.format("%Y%m%dT%H%M%SZ"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// How a substrate produces its answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateMode {
    /// A program that computes values and writes answer files
    Executable,
    /// A natural-language artifact interpreted by a model judge
    Fuzzy,
}

impl std::fmt::Display for SubstrateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubstrateMode::Executable => write!(f, "executable"),
            SubstrateMode::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

/// Why an execution was classified as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Process exited with a non-zero status
    NonZeroExit,
    /// Process exceeded its time limit and was killed
    Timeout,
    /// Process could not be started
    Spawn,
    /// Process succeeded but wrote no answer files
    NoOutput,
    /// Answer files exist but could not be parsed
    MalformedOutput,
    /// Another run holds this substrate's lock
    Locked,
    /// Prior output could not be backed up or restored
    Backup,
    /// Judge could not be reached at all
    Judge,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::NonZeroExit => "non-zero exit",
            FailureKind::Timeout => "timeout",
            FailureKind::Spawn => "spawn error",
            FailureKind::NoOutput => "no output",
            FailureKind::MalformedOutput => "malformed output",
            FailureKind::Locked => "locked",
            FailureKind::Backup => "backup error",
            FailureKind::Judge => "judge unavailable",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome of one substrate within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Executed and produced parseable output
    Succeeded,
    /// Execution failed; `restored` is true when prior output was put back
    Failed {
        kind: FailureKind,
        message: String,
        restored: bool,
    },
    /// Not attempted (disabled, missing credentials, stop requested)
    Skipped { reason: String },
    /// Interrupted by the operator mid-execution
    Aborted { restored: bool },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// True for outcomes that count as execution failures for exit status.
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }

    /// Short status label used in tables
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Skipped { .. } => "skipped",
            RunOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Score counts captured at grading time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub passed: u64,
    pub failed: u64,
    /// Fields excluded as not applicable
    pub excluded: u64,
    /// Fields graded (passed + failed)
    pub total: u64,
}

impl ScoreSnapshot {
    pub fn new(passed: u64, failed: u64, excluded: u64) -> Self {
        Self {
            passed,
            failed,
            excluded,
            total: passed + failed,
        }
    }

    /// Percentage in `[0, 100]`. An empty grade scores 100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.passed as f64 * 100.0 / self.total as f64
        }
    }
}

/// One ledger record: a substrate's result within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Run this entry belongs to
    pub run_id: RunId,
    /// Substrate name
    pub substrate: String,
    /// Executable or fuzzy
    pub mode: SubstrateMode,
    /// When execution began
    pub started_at: DateTime<Utc>,
    /// When execution ended
    pub finished_at: DateTime<Utc>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Process exit code, when a process ran to completion
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Terminal outcome
    pub outcome: RunOutcome,
    /// Score of the output currently in place after this run
    #[serde(default)]
    pub score: Option<ScoreSnapshot>,
    /// Digest of the rulebook the score was measured against
    pub rulebook_digest: ContentDigest,
    /// Run that produced the graded output (differs from `run_id` after a restore)
    #[serde(default)]
    pub results_from_run: Option<RunId>,
}

impl LedgerEntry {
    /// True when the graded output was produced by an earlier run.
    pub fn is_stale(&self) -> bool {
        match &self.results_from_run {
            Some(source) => source != &self.run_id,
            None => false,
        }
    }
}

/// Derived view over one substrate's history
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubstrateStatus {
    pub substrate: String,
    pub last_run: Option<LedgerEntry>,
    pub last_successful_run: Option<LedgerEntry>,
    pub total_runs: usize,
}

// ---------------------------------------------------------------------------
// RunLedger
// ---------------------------------------------------------------------------

/// Append-only run ledger.
///
/// Guarantees:
/// - `append` never modifies or removes an existing entry.
/// - `entries` returns every entry in append order.
/// - Views (`history`, `status`, `last_success`) are pure functions of
///   `entries`, so two backends holding the same entries agree on them.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: LedgerEntry) -> LedgerResult<()>;

    /// All entries, oldest first.
    async fn entries(&self) -> LedgerResult<Vec<LedgerEntry>>;

    /// Entries for one substrate, newest first.
    async fn history(&self, substrate: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.substrate == substrate)
            .collect();
        entries.reverse();
        Ok(entries)
    }

    /// Most recent entry whose outcome is `Succeeded`.
    async fn last_success(&self, substrate: &str) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self
            .history(substrate)
            .await?
            .into_iter()
            .find(|e| e.outcome.is_success()))
    }

    /// Last run and last successful run for one substrate.
    async fn status(&self, substrate: &str) -> LedgerResult<SubstrateStatus> {
        let history = self.history(substrate).await?;
        Ok(SubstrateStatus {
            substrate: substrate.to_string(),
            last_run: history.first().cloned(),
            last_successful_run: history.iter().find(|e| e.outcome.is_success()).cloned(),
            total_runs: history.len(),
        })
    }

    /// Entries belonging to one run, in append order.
    async fn run(&self, run_id: &RunId) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| &e.run_id == run_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_timestamp_and_suffix() {
        let when = DateTime::parse_from_rfc3339("2026-10-19T14:15:03Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = RunId::at(when);
        assert!(id.as_str().starts_with("20261019T141503Z-"));
        assert_eq!(id.as_str().len(), "20261019T141503Z-".len() + 8);
    }

    #[test]
    fn empty_score_is_full_marks() {
        assert_eq!(ScoreSnapshot::default().percent(), 100.0);
        assert_eq!(ScoreSnapshot::new(3, 1, 2).percent(), 75.0);
        assert_eq!(ScoreSnapshot::new(3, 1, 2).total, 4);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::Failed {
            kind: FailureKind::Timeout,
            message: "exceeded 60s".into(),
            restored: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["restored"], true);
    }

    #[test]
    fn digest_rejects_short_strings() {
        assert!(ContentDigest::try_from("abc".to_string()).is_err());
        let d = ContentDigest::from_bytes(b"rulebook");
        assert!(ContentDigest::try_from(d.as_str().to_uppercase()).is_ok());
    }
}
