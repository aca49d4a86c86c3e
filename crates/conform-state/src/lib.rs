//! Conform-State: persistence for substrate run history
//!
//! This crate owns the run ledger: one append-only record per
//! (substrate, run) carrying outcome, score and timing. History is never
//! rewritten, which is what lets reports explain score changes caused by
//! restore-on-failure.
//!
//! ## Layer 0 - Data/Persistence
//!
//! ## Key Components
//!
//! - `RunLedger`: async ledger trait
//! - `JsonlRunLedger`: newline-delimited JSON file backend
//! - `fakes::MemoryRunLedger`: in-memory backend for tests

mod error;
pub mod fakes;
pub mod jsonl_ledger;
pub mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use jsonl_ledger::JsonlRunLedger;
pub use ledger::{
    ContentDigest, FailureKind, LedgerEntry, RunId, RunLedger, RunOutcome, ScoreSnapshot,
    SubstrateMode, SubstrateStatus,
};
