//! Run orchestration: prepare the run directory, execute each substrate
//! under backup/restore, grade, record in the ledger, render reports.
//!
//! Configuration errors (malformed rulebook, cyclic formulas) surface from
//! [`Orchestrator::prepare`] before any substrate is touched. Everything a
//! substrate does wrong is contained in its own [`SubstrateReport`] and
//! ledger entry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use conform_core::artifact::{mark_latest, write_json_atomic};
use conform_core::fuzzy::TranscriptWriter;
use conform_core::grade::{grade, grade_dir};
use conform_core::{
    blank, obs, report, Artifact, ConformError, FuzzyGrader, GradeSummary, GroundTruthSet,
    HttpJudge, Judge, JudgeConfig, ReferenceEvaluator, Rulebook, RunLayout, RunManifest,
    RunReport, SubstrateReport,
};
use conform_state::{FailureKind, LedgerEntry, RunId, RunLedger, RunOutcome, SubstrateMode};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use crate::backup::{OutputTransaction, TransactionEnd};
use crate::config::{Defaults, FailurePolicy, OrchestratorConfig, SubstrateConfig};
use crate::decide::{FailureDecider, FixedDecider};
use crate::error::{RunnerError, RunnerResult};
use crate::lock::SubstrateLock;
use crate::runner::{self, RunRequest, Termination};
use crate::signal::StopSignal;
use crate::verdict::ExitVerdict;

/// Ledger entries per substrate shown in the report trend.
pub const TREND_LIMIT: usize = 5;

/// Per-invocation overrides of the configuration defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only this substrate
    pub substrate: Option<String>,
    pub jobs: Option<usize>,
    pub on_failure: Option<FailurePolicy>,
    /// Skip fuzzy substrates without contacting a judge
    pub no_judge: bool,
}

/// Ground truth and fixture written for one run.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: RunId,
    pub layout: RunLayout,
    pub manifest: RunManifest,
    pub rulebook: Rulebook,
    pub ground_truth: GroundTruthSet,
}

/// Finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub report: RunReport,
    pub layout: RunLayout,
    pub verdict: ExitVerdict,
}

#[derive(Clone)]
enum JudgeSlot {
    Ready(Arc<dyn Judge>),
    Unavailable(String),
}

/// Drives a whole conformance run.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    ledger: Arc<dyn RunLedger>,
    judge: JudgeSlot,
    signal: StopSignal,
    decider: Arc<dyn FailureDecider>,
}

impl Orchestrator {
    /// The judge is built from `[judge]`; a missing credential leaves fuzzy
    /// substrates to be skipped rather than failing here.
    pub fn new(config: OrchestratorConfig, ledger: Arc<dyn RunLedger>) -> Self {
        let judge = match &config.judge {
            Some(judge_config) => match HttpJudge::from_config(judge_config) {
                Ok(judge) => JudgeSlot::Ready(Arc::new(judge)),
                Err(e) => JudgeSlot::Unavailable(e.to_string()),
            },
            None => JudgeSlot::Unavailable("no [judge] section configured".into()),
        };
        Self {
            config: Arc::new(config),
            ledger,
            judge,
            signal: StopSignal::new(),
            decider: Arc::new(FixedDecider(true)),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = JudgeSlot::Ready(judge);
        self
    }

    pub fn with_signal(mut self, signal: StopSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn FailureDecider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn signal(&self) -> &StopSignal {
        &self.signal
    }

    /// Evaluate the rulebook and write answer keys, blank fixture, `run.json`
    /// and `LATEST` into a fresh run directory.
    pub fn prepare(&self) -> RunnerResult<PreparedRun> {
        let run_id = RunId::new();
        let rulebook = Rulebook::load(&self.config.rulebook).map_err(|e| match e {
            ConformError::Io { path, source } => RunnerError::Config(format!(
                "cannot read rulebook {}: {source}",
                path.display()
            )),
            other => other.into(),
        })?;
        let ground_truth = ReferenceEvaluator::new(&rulebook)?.evaluate()?;

        let layout = RunLayout::new(&self.config.workspace, &run_id);
        layout.create()?;
        ground_truth.write_dir(&layout.answer_keys_dir())?;
        blank(&ground_truth).write_dir(&layout.blank_tests_dir())?;

        let manifest = RunManifest {
            run_id: run_id.clone(),
            rulebook_path: self.config.rulebook.clone(),
            rulebook_digest: rulebook.digest.clone(),
            ground_truth_digest: ground_truth.digest()?,
            started_at: Utc::now(),
            finished_at: None,
        };
        write_json_atomic(&layout.manifest_path(), &manifest)?;
        mark_latest(&self.config.workspace, &run_id)?;
        info!(
            run_id = %run_id,
            dir = %layout.root().display(),
            rulebook_digest = %manifest.rulebook_digest.short(),
            ground_truth_digest = %manifest.ground_truth_digest.short(),
            "run prepared"
        );

        Ok(PreparedRun {
            run_id,
            layout,
            manifest,
            rulebook,
            ground_truth,
        })
    }

    /// Prepare, then run every selected substrate and write the reports.
    pub async fn run(&self, options: RunOptions) -> anyhow::Result<RunResult> {
        let selected = self.config.select(options.substrate.as_deref())?;
        let prepared = self.prepare()?;
        let span = obs::run_span(prepared.run_id.as_str());
        self.execute(prepared, selected, options)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        prepared: PreparedRun,
        selected: Vec<SubstrateConfig>,
        options: RunOptions,
    ) -> anyhow::Result<RunResult> {
        let clock = Instant::now();
        let PreparedRun {
            run_id,
            layout,
            mut manifest,
            rulebook,
            ground_truth,
        } = prepared;
        obs::emit_run_started(
            run_id.as_str(),
            &self.config.rulebook.display().to_string(),
            selected.len(),
        );

        let judge = if options.no_judge {
            JudgeSlot::Unavailable("judge disabled with --no-judge".into())
        } else {
            self.judge.clone()
        };
        let jobs = options.jobs.unwrap_or(self.config.defaults.jobs).max(1);
        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            layout: layout.clone(),
            rulebook,
            ground_truth,
            ledger: Arc::clone(&self.ledger),
            judge,
            judge_config: self.config.judge.clone().unwrap_or_default(),
            signal: self.signal.clone(),
            defaults: self.config.defaults.clone(),
            policy: options.on_failure.unwrap_or(self.config.defaults.on_failure),
            decider: Arc::clone(&self.decider),
            decide_lock: Mutex::new(()),
            backups_dir: self.config.backups_dir(),
            locks_dir: self.config.locks_dir(),
        });

        let substrates = if jobs == 1 {
            run_sequential(&ctx, selected).await
        } else {
            run_parallel(&ctx, selected, jobs).await
        };

        let finished_at = Utc::now();
        let mut report = RunReport {
            run_id: run_id.clone(),
            rulebook: self.config.rulebook.display().to_string(),
            rulebook_digest: manifest.rulebook_digest.clone(),
            ground_truth_digest: manifest.ground_truth_digest.clone(),
            started_at: manifest.started_at,
            finished_at,
            substrates,
            computed_columns: ctx
                .ground_truth
                .tables
                .iter()
                .map(|(name, table)| (name.clone(), table.computed_columns.clone()))
                .collect(),
            trend: Default::default(),
            interrupted: self.signal.is_stop_requested(),
        };
        if let Err(e) = report.attach_trend(self.ledger.as_ref(), TREND_LIMIT).await {
            warn!(error = %e, "ledger history unavailable for report trend");
        }
        report::write_run_reports(&layout, &report).context("write run reports")?;

        manifest.finished_at = Some(finished_at);
        write_json_atomic(&layout.manifest_path(), &manifest).context("update run.json")?;

        let verdict = if self.signal.is_aborted() {
            ExitVerdict::Aborted
        } else {
            ExitVerdict::from_report(&report)
        };
        let failed = report
            .substrates
            .iter()
            .filter(|s| s.outcome.is_failure())
            .count();
        obs::emit_run_finished(
            run_id.as_str(),
            clock.elapsed().as_millis() as u64,
            report.substrates.len() - failed,
            failed,
            self.signal.is_aborted(),
        );

        Ok(RunResult {
            report,
            layout,
            verdict,
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

async fn run_sequential(
    ctx: &Arc<RunContext>,
    selected: Vec<SubstrateConfig>,
) -> Vec<SubstrateReport> {
    let mut reports = Vec::with_capacity(selected.len());
    for substrate in selected {
        let report = if ctx.signal.is_stop_requested() {
            ctx.skip_interrupted(&substrate).await
        } else {
            run_and_decide(Arc::clone(ctx), substrate).await
        };
        reports.push(report);
    }
    reports
}

/// Up to `jobs` substrates at once. Reports come back in configuration order.
async fn run_parallel(
    ctx: &Arc<RunContext>,
    selected: Vec<SubstrateConfig>,
    jobs: usize,
) -> Vec<SubstrateReport> {
    let semaphore = Arc::new(Semaphore::new(jobs));
    let mut join_set = JoinSet::new();
    for (idx, substrate) in selected.iter().cloned().enumerate() {
        let ctx = Arc::clone(ctx);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let report = if ctx.signal.is_stop_requested() {
                    ctx.skip_interrupted(&substrate).await
                } else {
                    run_and_decide(ctx, substrate).await
                };
                (idx, report)
            }
            .in_current_span(),
        );
    }

    let mut slots: Vec<Option<SubstrateReport>> = vec![None; selected.len()];
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, report)) => slots[idx] = Some(report),
            Err(e) => error!(error = %e, "substrate task failed"),
        }
    }
    selected
        .iter()
        .zip(slots)
        .map(|(substrate, slot)| {
            slot.unwrap_or_else(|| SubstrateReport {
                substrate: substrate.name.clone(),
                mode: substrate.mode,
                outcome: RunOutcome::Failed {
                    kind: FailureKind::Spawn,
                    message: "substrate task did not complete".into(),
                    restored: false,
                },
                exit_code: None,
                duration_ms: 0,
                grade: None,
                results_from_run: None,
                log_path: None,
                transcript_path: None,
            })
        })
        .collect()
}

async fn run_and_decide(ctx: Arc<RunContext>, substrate: SubstrateConfig) -> SubstrateReport {
    let report = ctx.run_substrate(&substrate).await;
    if report.outcome.is_failure() {
        ctx.apply_failure_policy(&report).await;
    }
    report
}

// ---------------------------------------------------------------------------
// Per-substrate execution
// ---------------------------------------------------------------------------

struct RunContext {
    run_id: RunId,
    layout: RunLayout,
    rulebook: Rulebook,
    ground_truth: GroundTruthSet,
    ledger: Arc<dyn RunLedger>,
    judge: JudgeSlot,
    judge_config: JudgeConfig,
    signal: StopSignal,
    defaults: Defaults,
    policy: FailurePolicy,
    decider: Arc<dyn FailureDecider>,
    decide_lock: Mutex<()>,
    backups_dir: PathBuf,
    locks_dir: PathBuf,
}

/// What the substrate's output directory holds once the attempt is over.
enum OutputState {
    /// New output from this run, already graded
    Fresh(GradeSummary),
    /// Previous output put back after a failure
    Restored,
    /// Cleared, and there was nothing to restore
    Empty,
    /// Never touched (skipped, locked)
    Untouched,
}

struct Attempt {
    outcome: RunOutcome,
    output: OutputState,
    exit_code: Option<i32>,
    log_path: Option<PathBuf>,
    transcript_path: Option<PathBuf>,
}

impl Attempt {
    fn untouched(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            output: OutputState::Untouched,
            exit_code: None,
            log_path: None,
            transcript_path: None,
        }
    }
}

enum Verdict {
    Graded(GradeSummary),
    Failed(FailureKind, String),
    Aborted,
}

/// Roll back after a failed or aborted attempt. Returns the outcome and
/// what is left in the output directory.
fn roll_back(
    tx: OutputTransaction,
    failure: Option<(FailureKind, String)>,
) -> (RunOutcome, OutputState) {
    let output_dir = tx.output_dir().to_path_buf();
    let (restored, state) = match tx.restore() {
        Ok(TransactionEnd::Restored { had_prior: true }) => (true, OutputState::Restored),
        Ok(_) => (false, OutputState::Empty),
        Err(e) => {
            error!(output = %output_dir.display(), error = %e, "restore failed");
            (false, OutputState::Empty)
        }
    };
    let outcome = match failure {
        Some((kind, message)) => RunOutcome::Failed {
            kind,
            message,
            restored,
        },
        None => RunOutcome::Aborted { restored },
    };
    (outcome, state)
}

impl RunContext {
    async fn run_substrate(&self, substrate: &SubstrateConfig) -> SubstrateReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        obs::emit_substrate_started(
            self.run_id.as_str(),
            &substrate.name,
            &substrate.mode.to_string(),
        );

        let attempt = match substrate.mode {
            SubstrateMode::Executable => self.attempt_executable(substrate).await,
            SubstrateMode::Fuzzy => self.attempt_fuzzy(substrate).await,
        };
        self.finish(substrate, started_at, clock, attempt).await
    }

    async fn attempt_executable(&self, substrate: &SubstrateConfig) -> Attempt {
        let _lock = match SubstrateLock::acquire(&self.locks_dir, &substrate.name) {
            Ok(lock) => lock,
            Err(e) => {
                return Attempt::untouched(RunOutcome::Failed {
                    kind: FailureKind::Locked,
                    message: e.to_string(),
                    restored: false,
                })
            }
        };
        let output_dir = substrate.output_dir();
        let tx = match OutputTransaction::begin(&output_dir, &self.backups_dir) {
            Ok(tx) => tx,
            Err(e) => {
                return Attempt::untouched(RunOutcome::Failed {
                    kind: FailureKind::Backup,
                    message: e.to_string(),
                    restored: false,
                })
            }
        };

        let log_path = self.layout.log_path(&substrate.name);
        let blank_dir = self.layout.blank_tests_dir();
        let timeout = substrate.timeout(&self.defaults);
        let execution = runner::run(
            RunRequest {
                substrate,
                run_id: &self.run_id,
                blank_dir: &blank_dir,
                output_dir: &output_dir,
                log_path: &log_path,
                timeout,
            },
            &self.signal,
        )
        .await;

        let (verdict, exit_code, elapsed_ms) = match execution {
            Err(e) => (Verdict::Failed(FailureKind::Spawn, e.to_string()), None, 0),
            Ok(exec) => {
                let verdict = match exec.termination {
                    Termination::Aborted => Verdict::Aborted,
                    Termination::TimedOut => Verdict::Failed(
                        FailureKind::Timeout,
                        format!("killed after {}s", timeout.as_secs()),
                    ),
                    Termination::Signalled => {
                        Verdict::Failed(FailureKind::NonZeroExit, "terminated by signal".into())
                    }
                    Termination::Exited(code) if code != 0 => {
                        Verdict::Failed(FailureKind::NonZeroExit, format!("exit status {code}"))
                    }
                    Termination::Exited(_) => {
                        match grade_dir(&substrate.name, &self.ground_truth, &output_dir) {
                            Ok(Some(summary)) => Verdict::Graded(summary),
                            Ok(None) => Verdict::Failed(
                                FailureKind::NoOutput,
                                format!("no answer files in {}", output_dir.display()),
                            ),
                            Err(e) => Verdict::Failed(FailureKind::MalformedOutput, e.to_string()),
                        }
                    }
                };
                (verdict, exec.exit_code(), exec.elapsed_ms)
            }
        };

        let (outcome, output) = match verdict {
            Verdict::Graded(summary) => {
                tx.commit();
                (
                    RunOutcome::Succeeded,
                    OutputState::Fresh(summary.with_elapsed_ms(elapsed_ms)),
                )
            }
            Verdict::Failed(kind, message) => roll_back(tx, Some((kind, message))),
            Verdict::Aborted => roll_back(tx, None),
        };
        Attempt {
            outcome,
            output,
            exit_code,
            log_path: Some(log_path),
            transcript_path: None,
        }
    }

    async fn attempt_fuzzy(&self, substrate: &SubstrateConfig) -> Attempt {
        let judge = match &self.judge {
            JudgeSlot::Ready(judge) => Arc::clone(judge),
            JudgeSlot::Unavailable(reason) => {
                return Attempt::untouched(RunOutcome::Skipped {
                    reason: format!("judge unavailable: {reason}"),
                })
            }
        };
        let _lock = match SubstrateLock::acquire(&self.locks_dir, &substrate.name) {
            Ok(lock) => lock,
            Err(e) => {
                return Attempt::untouched(RunOutcome::Failed {
                    kind: FailureKind::Locked,
                    message: e.to_string(),
                    restored: false,
                })
            }
        };
        let artifact = match Artifact::load(&substrate.name, &substrate.artifacts) {
            Ok(artifact) => artifact,
            Err(e) => {
                return Attempt::untouched(RunOutcome::Failed {
                    kind: FailureKind::NoOutput,
                    message: format!("artifact unreadable: {e}"),
                    restored: false,
                })
            }
        };
        let output_dir = substrate.output_dir();
        let tx = match OutputTransaction::begin(&output_dir, &self.backups_dir) {
            Ok(tx) => tx,
            Err(e) => {
                return Attempt::untouched(RunOutcome::Failed {
                    kind: FailureKind::Backup,
                    message: e.to_string(),
                    restored: false,
                })
            }
        };

        let transcript_path = self.layout.transcript_path(&substrate.name);
        let mut grader = FuzzyGrader::new(&substrate.name, judge, &self.judge_config);
        match TranscriptWriter::create(&transcript_path).await {
            Ok(transcript) => grader = grader.with_transcript(transcript),
            Err(e) => warn!(substrate = %substrate.name, error = %e, "judge transcript disabled"),
        }

        let clock = Instant::now();
        let answered = tokio::select! {
            answers = grader.answer(&artifact, &self.rulebook, &self.ground_truth) => Some(answers),
            _ = self.signal.aborted() => None,
        };
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let verdict = match answered {
            None => Verdict::Aborted,
            Some(Err(e)) => Verdict::Failed(FailureKind::Judge, e.to_string()),
            Some(Ok(answers)) => match answers.output.write_dir(&output_dir) {
                Err(e) => Verdict::Failed(FailureKind::NoOutput, e.to_string()),
                Ok(()) => {
                    info!(
                        substrate = %substrate.name,
                        queried = answers.stats.fields_queried,
                        failed = answers.stats.fields_failed,
                        attempts = answers.stats.attempts,
                        "judge answers collected"
                    );
                    Verdict::Graded(
                        grade(&substrate.name, &self.ground_truth, &answers.output)
                            .with_mode(SubstrateMode::Fuzzy),
                    )
                }
            },
        };

        let (outcome, output) = match verdict {
            Verdict::Graded(summary) => {
                tx.commit();
                (
                    RunOutcome::Succeeded,
                    OutputState::Fresh(summary.with_elapsed_ms(elapsed_ms)),
                )
            }
            Verdict::Failed(kind, message) => roll_back(tx, Some((kind, message))),
            Verdict::Aborted => roll_back(tx, None),
        };
        Attempt {
            outcome,
            output,
            exit_code: None,
            log_path: None,
            transcript_path: Some(transcript_path),
        }
    }

    /// Record a substrate that was not started because of an interrupt.
    async fn skip_interrupted(&self, substrate: &SubstrateConfig) -> SubstrateReport {
        let reason = if self.signal.is_aborted() {
            "run aborted"
        } else {
            "stop requested"
        };
        let attempt = Attempt::untouched(RunOutcome::Skipped {
            reason: reason.into(),
        });
        self.finish(substrate, Utc::now(), Instant::now(), attempt)
            .await
    }

    /// Grade what is left, append the ledger entry, write the grade file.
    async fn finish(
        &self,
        substrate: &SubstrateConfig,
        started_at: DateTime<Utc>,
        clock: Instant,
        attempt: Attempt,
    ) -> SubstrateReport {
        let name = substrate.name.as_str();
        let previous_source = match self.ledger.history(name).await {
            Ok(history) => history.into_iter().next().and_then(|e| e.results_from_run),
            Err(e) => {
                warn!(substrate = %name, error = %e, "ledger history unavailable");
                None
            }
        };

        let (grade, results_from_run) = match attempt.output {
            OutputState::Fresh(summary) => (Some(summary), Some(self.run_id.clone())),
            OutputState::Restored => {
                obs::emit_output_restored(self.run_id.as_str(), name, attempt.outcome.label());
                let regraded = grade_dir(name, &self.ground_truth, &substrate.output_dir())
                    .ok()
                    .flatten()
                    .map(|g| g.with_mode(substrate.mode));
                (regraded, previous_source)
            }
            OutputState::Empty => (None, None),
            OutputState::Untouched => (None, previous_source),
        };

        if let Some(summary) = &grade {
            obs::emit_grade_completed(name, summary.passed, summary.failed, summary.score());
            if let Err(e) = summary.write_json(&self.layout.grade_path(name)) {
                warn!(substrate = %name, error = %e, "failed to write grade file");
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        let entry = LedgerEntry {
            run_id: self.run_id.clone(),
            substrate: name.to_string(),
            mode: substrate.mode,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            exit_code: attempt.exit_code,
            outcome: attempt.outcome.clone(),
            score: grade.as_ref().map(GradeSummary::snapshot),
            rulebook_digest: self.rulebook.digest.clone(),
            results_from_run: results_from_run.clone(),
        };
        if let Err(e) = self.ledger.append(entry).await {
            error!(substrate = %name, error = %e, "failed to append ledger entry");
        }
        obs::emit_substrate_finished(
            self.run_id.as_str(),
            name,
            attempt.outcome.label(),
            duration_ms,
        );

        SubstrateReport {
            substrate: name.to_string(),
            mode: substrate.mode,
            outcome: attempt.outcome,
            exit_code: attempt.exit_code,
            duration_ms,
            grade,
            results_from_run,
            log_path: attempt.log_path,
            transcript_path: attempt.transcript_path,
        }
    }

    async fn apply_failure_policy(&self, report: &SubstrateReport) {
        match self.policy {
            FailurePolicy::Continue => {}
            FailurePolicy::Stop => {
                info!(substrate = %report.substrate, "stopping after failed substrate");
                self.signal.request_stop();
            }
            FailurePolicy::Prompt => {
                let _guard = self.decide_lock.lock().await;
                if self.signal.is_stop_requested() {
                    return;
                }
                if !self
                    .decider
                    .should_continue(&report.substrate, &report.outcome)
                    .await
                {
                    self.signal.request_stop();
                }
            }
        }
    }
}
