//! Conform - substrate conformance CLI
//!
//! The `conform` command derives reference answers from a rulebook and grades
//! independent implementations ("substrates") against them.
//!
//! ## Commands
//!
//! - `run`: execute and grade substrates
//! - `report`: render an existing run without re-running anything
//! - `generate`: write answer keys and the blank fixture only
//! - `history`: per-substrate ledger history
//! - `levels`: dependency levels of every calculated field

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use conform_core::artifact::latest_run;
use conform_core::report::{read_summary_json, render_aggregate_md};
use conform_core::telemetry::init_tracing;
use conform_core::{resolve, ReportStatus, Rulebook, RunLayout};
use conform_runner::{
    ExitVerdict, FailureDecider, FailurePolicy, Orchestrator, OrchestratorConfig, RunOptions,
    RunResult, StopSignal, DEFAULT_CONFIG_FILE,
};
use conform_state::{JsonlRunLedger, RunId, RunLedger, RunOutcome};
use tracing::{warn, Level};

#[derive(Parser)]
#[command(name = "conform")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Grade substrate implementations against a rulebook", long_about = None)]
struct Cli {
    /// Orchestrator configuration file
    #[arg(short, long, global = true, env = "CONFORM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute substrates and grade their answers
    Run {
        /// Run only this substrate
        #[arg(short, long)]
        substrate: Option<String>,

        /// Substrates to run concurrently
        #[arg(short, long)]
        jobs: Option<usize>,

        /// What to do after a substrate fails to execute
        #[arg(long, value_name = "continue|stop|prompt")]
        on_failure: Option<FailurePolicy>,

        /// Skip fuzzy substrates instead of querying the judge
        #[arg(long)]
        no_judge: bool,
    },

    /// Print the aggregate report of an earlier run
    Report {
        /// Run ID (default: the latest run)
        #[arg(long)]
        run: Option<String>,
    },

    /// Write answer keys and the blank fixture without running substrates
    Generate,

    /// Show ledger history
    History {
        /// Only this substrate (default: every configured substrate)
        #[arg(short, long)]
        substrate: Option<String>,

        /// Maximum entries per substrate
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print dependency levels of calculated fields
    Levels,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitVerdict::from_error(&e).code()
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            substrate,
            jobs,
            on_failure,
            no_judge,
        } => {
            let options = RunOptions {
                substrate,
                jobs,
                on_failure,
                no_judge,
            };
            cmd_run(&cli.config, options).await
        }
        Commands::Report { run } => cmd_report(&cli.config, run).map(|_| 0),
        Commands::Generate => cmd_generate(&cli.config).map(|_| 0),
        Commands::History { substrate, limit } => {
            cmd_history(&cli.config, substrate.as_deref(), limit)
                .await
                .map(|_| 0)
        }
        Commands::Levels => cmd_levels(&cli.config).map(|_| 0),
    }
}

fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    OrchestratorConfig::load(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))
}

/// Execute the configured substrates.
async fn cmd_run(config_path: &Path, options: RunOptions) -> Result<i32> {
    let config = load_config(config_path)?;
    let ledger = Arc::new(JsonlRunLedger::new(config.ledger_path()));
    let signal = StopSignal::new();
    let listener = signal.listen_ctrl_c();

    let orchestrator = Orchestrator::new(config, ledger)
        .with_signal(signal)
        .with_decider(Arc::new(StdinDecider));
    let result = orchestrator.run(options).await;
    listener.abort();
    let result = result?;

    print_summary(&result);
    Ok(result.verdict.code())
}

fn print_summary(result: &RunResult) {
    let report = &result.report;
    println!();
    println!("Run {}", report.run_id);
    for sub in &report.substrates {
        let status = sub.status();
        let mark = match status {
            ReportStatus::Pass => "✓",
            ReportStatus::Fail => "✗",
            ReportStatus::Crashed => "!",
            ReportStatus::Skipped => "-",
            ReportStatus::Aborted => "x",
        };
        let score = match sub.score() {
            Some(s) => format!("{:.1}% ({}/{})", s.percent(), s.passed, s.total),
            None => "-".to_string(),
        };
        let note = match &sub.outcome {
            RunOutcome::Failed { kind, message, .. } => format!("  {kind}: {message}"),
            RunOutcome::Skipped { reason } => format!("  {reason}"),
            _ => String::new(),
        };
        println!(
            "  {mark} {:<24} {:<8} {score}{note}",
            sub.substrate,
            status.as_str()
        );
    }
    println!();
    println!("Report: {}", result.layout.aggregate_report_path().display());
}

/// Render the aggregate report of a finished run.
fn cmd_report(config_path: &Path, run: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let run_id = match run {
        Some(id) => RunId(id),
        None => latest_run(&config.workspace)?
            .context("No runs recorded yet; start one with `conform run`")?,
    };
    let layout = RunLayout::new(&config.workspace, &run_id);
    let summary = layout.summary_path();
    if !summary.exists() {
        anyhow::bail!("Run {} has no results ({})", run_id, summary.display());
    }
    let report = read_summary_json(&summary)?;
    print!("{}", render_aggregate_md(&report));
    Ok(())
}

/// Write answer keys and the blank fixture into a new run directory.
fn cmd_generate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = Arc::new(JsonlRunLedger::new(config.ledger_path()));
    let prepared = Orchestrator::new(config, ledger).prepare()?;

    println!("Run {}", prepared.run_id);
    println!("  answer keys: {}", prepared.layout.answer_keys_dir().display());
    println!("  blank tests: {}", prepared.layout.blank_tests_dir().display());
    println!(
        "  ground truth digest: {}",
        prepared.manifest.ground_truth_digest.short()
    );
    Ok(())
}

/// Ledger history per substrate, newest first.
async fn cmd_history(config_path: &Path, substrate: Option<&str>, limit: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = JsonlRunLedger::new(config.ledger_path());
    let names: Vec<String> = match substrate {
        Some(name) => vec![name.to_string()],
        None => config.substrates.iter().map(|s| s.name.clone()).collect(),
    };

    for name in names {
        let status = ledger.status(&name).await?;
        if status.total_runs == 0 {
            println!("{name}: no runs recorded");
            continue;
        }
        let last_good = status
            .last_successful_run
            .as_ref()
            .map(|e| e.run_id.to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{name}: {} runs, last success {last_good}",
            status.total_runs
        );

        for entry in ledger.history(&name).await?.into_iter().take(limit) {
            let score = entry
                .score
                .map(|s| format!("{:.1}%", s.percent()))
                .unwrap_or_else(|| "-".to_string());
            let source = match &entry.results_from_run {
                Some(source) if entry.is_stale() => format!("  (results from {source})"),
                _ => String::new(),
            };
            println!(
                "  {}  {}  {:<9} {:>7}{source}",
                entry.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.run_id,
                entry.outcome.label(),
                score
            );
        }
    }
    Ok(())
}

/// Dependency levels of every entity in the configured rulebook.
fn cmd_levels(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let rulebook = Rulebook::load(&config.rulebook)?;

    for entity in &rulebook.entities {
        let plan = resolve(entity)?;
        println!("{} (max level {})", entity.name, plan.max_level());
        for (level, fields) in plan.by_level() {
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            println!("  level {level}: {}", names.join(", "));
        }
    }
    Ok(())
}

/// Asks on the terminal whether to continue after a failure. End of input
/// or a read error counts as "no".
struct StdinDecider;

#[async_trait]
impl FailureDecider for StdinDecider {
    async fn should_continue(&self, substrate: &str, outcome: &RunOutcome) -> bool {
        let reason = match outcome {
            RunOutcome::Failed { kind, message, .. } => format!("{kind}: {message}"),
            other => other.label().to_string(),
        };
        let prompt = format!("{substrate} failed ({reason}). Continue with the remaining substrates? [Y/n] ");
        let answer = tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => false,
                Ok(_) => !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no"),
            }
        })
        .await;
        answer.unwrap_or_else(|e| {
            warn!(error = %e, "prompt task failed");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "conform",
            "--config",
            "x.toml",
            "run",
            "--substrate",
            "python",
            "--jobs",
            "2",
            "--on-failure",
            "stop",
            "--no-judge",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Run {
                substrate,
                jobs,
                on_failure,
                no_judge,
            } => {
                assert_eq!(substrate.as_deref(), Some("python"));
                assert_eq!(jobs, Some(2));
                assert_eq!(on_failure, Some(FailurePolicy::Stop));
                assert!(no_judge);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn unknown_failure_policy_is_rejected() {
        assert!(Cli::try_parse_from(["conform", "run", "--on-failure", "sometimes"]).is_err());
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let rulebook = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../conform-core/tests/fixtures/language_candidates.json");
        std::fs::copy(rulebook, dir.path().join("rulebook.json")).unwrap();
        std::fs::write(
            dir.path().join("conform.toml"),
            "rulebook = \"rulebook.json\"\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn generate_writes_fixture_and_report_needs_results() {
        let dir = workspace();
        let config = dir.path().join("conform.toml");
        assert!(cmd_report(&config, None).is_err());

        cmd_generate(&config).unwrap();
        let runs = dir.path().join(".conform/runs");
        let latest = std::fs::read_to_string(runs.join("LATEST")).unwrap();
        let run_dir = runs.join(latest.trim());
        assert!(run_dir.join("blank-tests/LanguageCandidates.json").exists());
        assert!(run_dir.join("answer-keys/LanguageCandidates.json").exists());
        // generated only: nothing to render yet
        assert!(cmd_report(&config, None).is_err());
    }

    #[test]
    fn missing_config_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_levels(&dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(ExitVerdict::from_error(&err), ExitVerdict::Configuration);
    }

    #[tokio::test]
    async fn history_without_runs_is_empty() {
        let dir = workspace();
        cmd_history(&dir.path().join("conform.toml"), Some("python"), 5)
            .await
            .unwrap();
    }
}
