//! Conform-Runner: substrate execution and run orchestration
//!
//! Launches each configured substrate as an external process against the
//! blank fixture, protects its previous output with a backup that is
//! restored on any failure, grades what it wrote, and records the outcome
//! in the run ledger.
//!
//! ## Layer 2 - Execution
//!
//! - `config`: `conform.toml` model
//! - `runner`: one process, with timeout and abort
//! - `backup`: output directory transaction
//! - `lock`: per-substrate advisory lock
//! - `signal`: two-stage interrupt (stop, then abort)
//! - `orchestrator`: the whole run

pub mod backup;
pub mod config;
pub mod decide;
mod error;
pub mod lock;
pub mod orchestrator;
pub mod runner;
pub mod signal;
pub mod verdict;

pub use error::{RunnerError, RunnerResult};

pub use config::{
    Defaults, FailurePolicy, OrchestratorConfig, SubstrateConfig, DEFAULT_CONFIG_FILE,
};

pub use decide::{FailureDecider, FixedDecider};

pub use orchestrator::{Orchestrator, PreparedRun, RunOptions, RunResult, TREND_LIMIT};

pub use signal::{Interrupt, StopSignal};

pub use verdict::ExitVerdict;
