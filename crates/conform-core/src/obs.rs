//! Structured lifecycle events for conformance runs.
//!
//! Every event is an `info!` (or `warn!`) line carrying an `event` field, so
//! JSON logs can be filtered by event name. Use [`run_span`] with
//! `tracing::Instrument` for async work; [`RunSpan`] is for synchronous
//! sections only.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped span.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// Span tagged with the run id.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("conform.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, rulebook: &str, substrates: usize) {
    info!(event = "run.started", run_id = %run_id, rulebook = %rulebook, substrates = substrates);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, succeeded: usize, failed: usize, aborted: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        failed = failed,
        aborted = aborted,
    );
}

pub fn emit_substrate_started(run_id: &str, substrate: &str, mode: &str) {
    info!(event = "substrate.started", run_id = %run_id, substrate = %substrate, mode = %mode);
}

/// `outcome` is the ledger label: succeeded, failed, skipped or aborted.
pub fn emit_substrate_finished(run_id: &str, substrate: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "substrate.finished",
        run_id = %run_id,
        substrate = %substrate,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Output directory rolled back to its pre-run contents.
pub fn emit_output_restored(run_id: &str, substrate: &str, reason: &str) {
    warn!(event = "substrate.restored", run_id = %run_id, substrate = %substrate, reason = %reason);
}

pub fn emit_grade_completed(substrate: &str, passed: u64, failed: u64, score: f64) {
    info!(
        event = "grade.completed",
        substrate = %substrate,
        passed = passed,
        failed = failed,
        score = score,
    );
}

pub fn emit_judge_queried(substrate: &str, entity: &str, key: &str, field: &str, attempt: u32, ok: bool) {
    info!(
        event = "judge.queried",
        substrate = %substrate,
        entity = %entity,
        key = %key,
        field = %field,
        attempt = attempt,
        ok = ok,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters() {
        let _span = RunSpan::enter("20260101T000000Z-deadbeef");
        emit_substrate_started("20260101T000000Z-deadbeef", "python", "executable");
    }
}
