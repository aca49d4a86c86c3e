//! The "continue after a failure?" question for `on_failure = "prompt"`.

use async_trait::async_trait;
use conform_state::RunOutcome;

/// Decides whether the run continues after a substrate failed to execute.
#[async_trait]
pub trait FailureDecider: Send + Sync {
    /// `true` to carry on with the remaining substrates.
    async fn should_continue(&self, substrate: &str, outcome: &RunOutcome) -> bool;
}

/// Always gives the same answer; used when no operator is attached.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecider(pub bool);

#[async_trait]
impl FailureDecider for FixedDecider {
    async fn should_continue(&self, _substrate: &str, _outcome: &RunOutcome) -> bool {
        self.0
    }
}
