//! Report rendering: per-substrate markdown, the aggregate markdown table,
//! and the machine-readable `summary.json`.
//!
//! Nothing here grades. Reports are built from the run's [`GradeSummary`]s
//! and ledger history, and can be re-rendered from `summary.json` alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use conform_state::{
    ContentDigest, LedgerResult, RunId, RunLedger, RunOutcome, ScoreSnapshot, SubstrateMode,
};
use serde::{Deserialize, Serialize};

use crate::artifact::RunLayout;
use crate::grade::GradeSummary;

/// Mismatches listed per entity in a substrate report.
pub const MAX_LISTED_MISMATCHES: usize = 50;

const CELL_WIDTH: usize = 40;

/// Report status of one substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    /// Ran, every graded field matched
    Pass,
    /// Ran, with mismatches
    Fail,
    /// Execution failure
    Crashed,
    Skipped,
    Aborted,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pass => "PASS",
            ReportStatus::Fail => "FAIL",
            ReportStatus::Crashed => "CRASHED",
            ReportStatus::Skipped => "SKIPPED",
            ReportStatus::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One substrate's part of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstrateReport {
    pub substrate: String,
    pub mode: SubstrateMode,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Grade of the output in place after this run. After a restore this
    /// grades the earlier run's output.
    pub grade: Option<GradeSummary>,
    /// Run that produced the graded output
    pub results_from_run: Option<RunId>,
    pub log_path: Option<PathBuf>,
    pub transcript_path: Option<PathBuf>,
}

impl SubstrateReport {
    pub fn status(&self) -> ReportStatus {
        match &self.outcome {
            RunOutcome::Succeeded => match &self.grade {
                Some(grade) if grade.failed == 0 => ReportStatus::Pass,
                Some(_) => ReportStatus::Fail,
                None => ReportStatus::Crashed,
            },
            RunOutcome::Failed { .. } => ReportStatus::Crashed,
            RunOutcome::Skipped { .. } => ReportStatus::Skipped,
            RunOutcome::Aborted { .. } => ReportStatus::Aborted,
        }
    }

    pub fn score(&self) -> Option<ScoreSnapshot> {
        self.grade.as_ref().map(GradeSummary::snapshot)
    }

    fn is_fuzzy(&self) -> bool {
        self.mode == SubstrateMode::Fuzzy
    }
}

/// One point of a substrate's score history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub run_id: RunId,
    pub outcome: String,
    pub score: Option<ScoreSnapshot>,
    pub stale: bool,
}

/// Totals across deterministic substrates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OverallStats {
    pub substrates: usize,
    pub executed: usize,
    pub crashed: usize,
    pub skipped: usize,
    pub passed_fields: u64,
    pub failed_fields: u64,
    pub pass_rate: f64,
}

/// Everything the aggregate views are rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub rulebook: String,
    pub rulebook_digest: ContentDigest,
    pub ground_truth_digest: ContentDigest,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub substrates: Vec<SubstrateReport>,
    /// Calculated columns per entity
    pub computed_columns: BTreeMap<String, Vec<String>>,
    /// Recent ledger history per substrate, newest first
    #[serde(default)]
    pub trend: BTreeMap<String, Vec<TrendPoint>>,
    /// True when the run was stopped or aborted before every substrate ran
    #[serde(default)]
    pub interrupted: bool,
}

impl RunReport {
    pub fn deterministic(&self) -> impl Iterator<Item = &SubstrateReport> {
        self.substrates.iter().filter(|s| !s.is_fuzzy())
    }

    pub fn fuzzy(&self) -> impl Iterator<Item = &SubstrateReport> {
        self.substrates.iter().filter(|s| s.is_fuzzy())
    }

    /// Totals over deterministic substrates only; fuzzy scores are advisory.
    pub fn overall(&self) -> OverallStats {
        let mut stats = OverallStats::default();
        for s in self.deterministic() {
            stats.substrates += 1;
            match s.status() {
                ReportStatus::Pass | ReportStatus::Fail => {
                    stats.executed += 1;
                    if let Some(score) = s.score() {
                        stats.passed_fields += score.passed;
                        stats.failed_fields += score.failed;
                    }
                }
                ReportStatus::Crashed => stats.crashed += 1,
                ReportStatus::Skipped | ReportStatus::Aborted => stats.skipped += 1,
            }
        }
        stats.pass_rate = ScoreSnapshot::new(stats.passed_fields, stats.failed_fields, 0).percent();
        stats
    }

    /// Fill [`RunReport::trend`] with the last `limit` ledger entries of
    /// every substrate in the run.
    pub async fn attach_trend(&mut self, ledger: &dyn RunLedger, limit: usize) -> LedgerResult<()> {
        let mut trend = BTreeMap::new();
        for s in &self.substrates {
            let points = ledger
                .history(&s.substrate)
                .await?
                .into_iter()
                .take(limit)
                .map(|entry| TrendPoint {
                    stale: entry.is_stale(),
                    run_id: entry.run_id,
                    outcome: entry.outcome.label().to_string(),
                    score: entry.score,
                })
                .collect();
            trend.insert(s.substrate.clone(), points);
        }
        self.trend = trend;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn truncate_cell(text: &str) -> String {
    let flat = text.replace('\n', " ").replace('|', "\\|");
    if flat.chars().count() <= CELL_WIDTH {
        flat
    } else {
        let cut: String = flat.chars().take(CELL_WIDTH - 3).collect();
        format!("{cut}...")
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}

fn score_cell(score: Option<ScoreSnapshot>) -> String {
    match score {
        Some(s) => format!("{:.1}%", s.percent()),
        None => "-".to_string(),
    }
}

/// Render `reports/<substrate>.md`.
pub fn render_substrate_md(report: &SubstrateReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} ({})\n\n", report.substrate, report.status()));
    if report.is_fuzzy() {
        out.push_str(
            "> Fuzzy substrate: values were inferred by a language-model judge. \
             Scores are advisory and may vary between runs.\n\n",
        );
    }

    out.push_str("| Metric | Value |\n|--------|-------|\n");
    let score = report.score().unwrap_or_default();
    out.push_str(&format!("| Fields tested | {} |\n", score.total));
    out.push_str(&format!("| Passed | {} |\n", score.passed));
    out.push_str(&format!("| Failed | {} |\n", score.failed));
    out.push_str(&format!("| Excluded | {} |\n", score.excluded));
    out.push_str(&format!("| Score | {} |\n", score_cell(report.score())));
    out.push_str(&format!("| Duration | {} |\n", seconds(report.duration_ms)));
    if let Some(code) = report.exit_code {
        out.push_str(&format!("| Exit code | {code} |\n"));
    }
    out.push('\n');

    match &report.outcome {
        RunOutcome::Failed {
            kind,
            message,
            restored,
        } => {
            out.push_str("## Execution failure\n\n");
            out.push_str(&format!("```\n{kind}: {message}\n```\n\n"));
            if *restored {
                out.push_str("Previous output was restored.");
                if let Some(from) = &report.results_from_run {
                    out.push_str(&format!(" Scores above are from run `{from}`."));
                }
                out.push_str("\n\n");
            }
        }
        RunOutcome::Skipped { reason } => {
            out.push_str(&format!("Skipped: {reason}\n\n"));
        }
        RunOutcome::Aborted { restored } => {
            out.push_str(&format!(
                "Aborted by operator (output restored: {restored}).\n\n"
            ));
        }
        RunOutcome::Succeeded => {}
    }
    if let Some(log) = &report.log_path {
        out.push_str(&format!("Log: `{}`\n\n", log.display()));
    }
    if let Some(transcript) = &report.transcript_path {
        out.push_str(&format!("Judge transcript: `{}`\n\n", transcript.display()));
    }

    let Some(grade) = &report.grade else {
        return out;
    };
    for entity in &grade.entities {
        out.push_str(&format!(
            "## {}\n\n{} records, {} passed, {} failed, {} excluded\n\n",
            entity.entity, entity.records, entity.passed, entity.failed, entity.excluded
        ));
        let failures: Vec<_> = grade
            .failures()
            .filter(|f| f.entity == entity.entity)
            .collect();
        if failures.is_empty() {
            continue;
        }
        out.push_str("| Record | Field | Expected | Actual |\n|--------|-------|----------|--------|\n");
        for f in failures.iter().take(MAX_LISTED_MISMATCHES) {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                truncate_cell(&f.key),
                f.field,
                truncate_cell(&f.expected.to_string()),
                truncate_cell(&f.actual_display()),
            ));
        }
        if failures.len() > MAX_LISTED_MISMATCHES {
            out.push_str(&format!(
                "\n... and {} more\n",
                failures.len() - MAX_LISTED_MISMATCHES
            ));
        }
        out.push('\n');
    }
    out
}

fn substrate_row(s: &SubstrateReport) -> String {
    let status = s.status();
    let score = match (status, &s.results_from_run) {
        (ReportStatus::Crashed, Some(from)) => {
            format!("{} (last good, run `{from}`)", score_cell(s.score()))
        }
        (ReportStatus::Crashed | ReportStatus::Skipped | ReportStatus::Aborted, None) => {
            "-".to_string()
        }
        _ => score_cell(s.score()),
    };
    let counts = s
        .score()
        .map(|sc| format!("{} / {}", sc.passed, sc.total))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "| {} | {} | {} | {} | {} |\n",
        s.substrate,
        status,
        counts,
        score,
        seconds(s.duration_ms)
    )
}

/// Render `all-tests-results.md`.
pub fn render_aggregate_md(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("# Conformance Results\n\n");
    out.push_str(&format!(
        "- run: `{}`\n- rulebook: `{}` (`{}`)\n- ground truth: `{}`\n- started: {}\n- finished: {}\n\n",
        report.run_id,
        report.rulebook,
        report.rulebook_digest.short(),
        report.ground_truth_digest.short(),
        report.started_at.to_rfc3339(),
        report.finished_at.to_rfc3339(),
    ));
    if report.interrupted {
        out.push_str("**Run interrupted before all substrates completed.**\n\n");
    }

    const HEADER: &str =
        "| Substrate | Status | Passed / Tested | Score | Duration |\n|-----------|--------|-----------------|-------|----------|\n";

    out.push_str("## Substrates\n\n");
    out.push_str(HEADER);
    for s in report.deterministic() {
        out.push_str(&substrate_row(s));
    }
    out.push('\n');

    if report.fuzzy().next().is_some() {
        out.push_str("## Fuzzy substrates (advisory)\n\n");
        out.push_str(
            "Values below were inferred by a language-model judge and are not \
             comparable run to run.\n\n",
        );
        out.push_str(HEADER);
        for s in report.fuzzy() {
            out.push_str(&substrate_row(s));
        }
        out.push('\n');
    }

    let stats = report.overall();
    out.push_str("## Overall\n\n");
    out.push_str(&format!(
        "- substrates: {} ({} executed, {} crashed, {} skipped)\n- fields passed: {} of {}\n- pass rate: {:.1}%\n\n",
        stats.substrates,
        stats.executed,
        stats.crashed,
        stats.skipped,
        stats.passed_fields,
        stats.passed_fields + stats.failed_fields,
        stats.pass_rate,
    ));

    out.push_str("## Computed columns\n\n");
    for (entity, columns) in &report.computed_columns {
        out.push_str(&format!("- {}: {}\n", entity, columns.join(", ")));
    }
    out.push('\n');

    if report.trend.values().any(|points| !points.is_empty()) {
        out.push_str("## Recent history\n\n| Substrate | Runs (newest first) |\n|-----------|---------------------|\n");
        for (substrate, points) in &report.trend {
            let cells: Vec<String> = points
                .iter()
                .map(|p| {
                    let mark = if p.stale { "*" } else { "" };
                    match p.score {
                        Some(score) => format!("{:.1}%{mark}", score.percent()),
                        None => p.outcome.clone(),
                    }
                })
                .collect();
            out.push_str(&format!("| {} | {} |\n", substrate, cells.join(" ← ")));
        }
        out.push_str("\n`*` score measured on output restored from an earlier run\n");
    }
    out
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Write `summary.json` in pretty JSON format.
pub fn write_summary_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run summary")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

pub fn read_summary_json(path: &Path) -> Result<RunReport> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))
}

/// Write every report of a run into its run directory.
pub fn write_run_reports(layout: &RunLayout, report: &RunReport) -> Result<()> {
    let reports_dir = layout.reports_dir();
    std::fs::create_dir_all(&reports_dir).with_context(|| format!("create {:?}", reports_dir))?;
    for s in &report.substrates {
        let path = layout.substrate_report_path(&s.substrate);
        std::fs::write(&path, render_substrate_md(s)).with_context(|| format!("write {:?}", path))?;
    }
    let aggregate = layout.aggregate_report_path();
    std::fs::write(&aggregate, render_aggregate_md(report))
        .with_context(|| format!("write {:?}", aggregate))?;
    write_summary_json(&layout.summary_path(), report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grade::{EntityGrade, FieldGrade, Verdict};
    use crate::value::Value;
    use conform_state::FailureKind;

    fn digest() -> ContentDigest {
        ContentDigest::from_bytes(b"rulebook")
    }

    fn grade(substrate: &str, mode: SubstrateMode, passed: u64, failed: u64) -> GradeSummary {
        let fields = (0..failed)
            .map(|i| FieldGrade {
                entity: "E".into(),
                key: format!("k{i}"),
                field: "Question".into(),
                expected: Value::text("Is English a language?"),
                actual: None,
                verdict: Verdict::MissingField,
            })
            .collect();
        GradeSummary {
            substrate: substrate.into(),
            mode,
            entities: vec![EntityGrade {
                entity: "E".into(),
                records: 3,
                passed,
                failed,
                excluded: 0,
            }],
            fields,
            passed,
            failed,
            excluded: 0,
            total: passed + failed,
            elapsed_ms: 1200,
            grading_ms: 3,
        }
    }

    fn substrate(name: &str, mode: SubstrateMode, outcome: RunOutcome, grade: Option<GradeSummary>) -> SubstrateReport {
        SubstrateReport {
            substrate: name.into(),
            mode,
            outcome,
            exit_code: Some(0),
            duration_ms: 1200,
            grade,
            results_from_run: Some(RunId("20260101T000000Z-00000000".into())),
            log_path: None,
            transcript_path: None,
        }
    }

    fn run_report() -> RunReport {
        let at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("parse RFC3339")
            .with_timezone(&Utc);
        RunReport {
            run_id: RunId("20260102T000000Z-11111111".into()),
            rulebook: "rulebook.json".into(),
            rulebook_digest: digest(),
            ground_truth_digest: digest(),
            started_at: at,
            finished_at: at,
            substrates: vec![
                substrate(
                    "python",
                    SubstrateMode::Executable,
                    RunOutcome::Succeeded,
                    Some(grade("python", SubstrateMode::Executable, 3, 0)),
                ),
                substrate(
                    "golang",
                    SubstrateMode::Executable,
                    RunOutcome::Failed {
                        kind: FailureKind::NonZeroExit,
                        message: "exit status 3".into(),
                        restored: true,
                    },
                    Some(grade("golang", SubstrateMode::Executable, 2, 1)),
                ),
                substrate(
                    "english",
                    SubstrateMode::Fuzzy,
                    RunOutcome::Succeeded,
                    Some(grade("english", SubstrateMode::Fuzzy, 1, 2)),
                ),
            ],
            computed_columns: BTreeMap::from([(
                "E".to_string(),
                vec!["HasGrammar".to_string(), "Question".to_string()],
            )]),
            trend: BTreeMap::new(),
            interrupted: false,
        }
    }

    #[test]
    fn crashed_is_distinct_from_low_score() {
        let report = run_report();
        let statuses: Vec<_> = report.substrates.iter().map(|s| s.status()).collect();
        assert_eq!(
            statuses,
            vec![ReportStatus::Pass, ReportStatus::Crashed, ReportStatus::Fail]
        );
    }

    #[test]
    fn fuzzy_substrates_get_their_own_table() {
        let md = render_aggregate_md(&run_report());
        let fuzzy_at = md.find("## Fuzzy substrates (advisory)").expect("fuzzy section");
        let english_at = md.find("| english |").expect("english row");
        let python_at = md.find("| python |").expect("python row");
        assert!(python_at < fuzzy_at && fuzzy_at < english_at);
        assert!(md.contains("(last good, run `20260101T000000Z-00000000`)"));
    }

    #[test]
    fn overall_stats_ignore_fuzzy_and_crashed() {
        let stats = run_report().overall();
        assert_eq!(stats.substrates, 2);
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.crashed, 1);
        assert_eq!(stats.passed_fields, 3);
        assert_eq!(stats.pass_rate, 100.0);
    }

    #[test]
    fn substrate_report_lists_missing_fields() {
        let report = &run_report().substrates[1];
        let md = render_substrate_md(report);
        assert!(md.contains("# golang (CRASHED)"));
        assert!(md.contains("non_zero_exit") || md.contains("exit status 3"));
        assert!(md.contains("| k0 | Question | \"Is English a language?\" | missing |"));
    }

    #[test]
    fn long_cells_are_truncated() {
        let cell = truncate_cell(&"x".repeat(100));
        assert_eq!(cell.chars().count(), CELL_WIDTH);
        assert!(cell.ends_with("..."));
    }

    #[test]
    fn aggregate_render_is_stable() {
        let report = run_report();
        assert_eq!(render_aggregate_md(&report), render_aggregate_md(&report));
    }

    #[test]
    fn summary_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let report = run_report();
        write_summary_json(&path, &report).unwrap();
        assert_eq!(read_summary_json(&path).unwrap(), report);
    }

    #[tokio::test]
    async fn trend_comes_from_ledger_newest_first() {
        use conform_state::fakes::MemoryRunLedger;
        use conform_state::LedgerEntry;

        let ledger = MemoryRunLedger::new();
        for (i, passed) in [1u64, 2, 3].into_iter().enumerate() {
            let at = Utc::now();
            ledger
                .append(LedgerEntry {
                    run_id: RunId(format!("run-{i}")),
                    substrate: "python".into(),
                    mode: SubstrateMode::Executable,
                    started_at: at,
                    finished_at: at,
                    duration_ms: 10,
                    exit_code: Some(0),
                    outcome: RunOutcome::Succeeded,
                    score: Some(ScoreSnapshot::new(passed, 3 - passed, 0)),
                    rulebook_digest: digest(),
                    results_from_run: Some(RunId(format!("run-{i}"))),
                })
                .await
                .unwrap();
        }
        let mut report = run_report();
        report.attach_trend(&ledger, 2).await.unwrap();
        let points = &report.trend["python"];
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].run_id, RunId("run-2".into()));
        assert!(render_aggregate_md(&report).contains("## Recent history"));
    }
}
