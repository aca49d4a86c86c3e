//! Process exit status of a run.

use conform_core::RunReport;
use conform_state::RunOutcome;

use crate::error::RunnerError;

/// Overall result of a `conform` invocation.
///
/// Value mismatches never change the verdict; only execution failures,
/// configuration errors and aborts do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    /// Every selected substrate executed
    Clean,
    /// At least one substrate failed to execute
    ExecutionFailures,
    /// Rulebook or configuration could not be trusted
    Configuration,
    Aborted,
}

impl ExitVerdict {
    pub fn code(&self) -> i32 {
        match self {
            ExitVerdict::Clean => 0,
            ExitVerdict::ExecutionFailures => 1,
            ExitVerdict::Configuration => 2,
            ExitVerdict::Aborted => 130,
        }
    }

    pub fn from_report(report: &RunReport) -> Self {
        let outcomes = || report.substrates.iter().map(|s| &s.outcome);
        if outcomes().any(|o| matches!(o, RunOutcome::Aborted { .. })) {
            ExitVerdict::Aborted
        } else if outcomes().any(RunOutcome::is_failure) {
            ExitVerdict::ExecutionFailures
        } else {
            ExitVerdict::Clean
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        let configuration = err.chain().any(|cause| {
            cause
                .downcast_ref::<RunnerError>()
                .is_some_and(RunnerError::is_configuration)
                || cause
                    .downcast_ref::<conform_core::ConformError>()
                    .is_some_and(conform_core::ConformError::is_configuration)
        });
        if configuration {
            ExitVerdict::Configuration
        } else {
            ExitVerdict::ExecutionFailures
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn codes() {
        assert_eq!(ExitVerdict::Clean.code(), 0);
        assert_eq!(ExitVerdict::ExecutionFailures.code(), 1);
        assert_eq!(ExitVerdict::Configuration.code(), 2);
        assert_eq!(ExitVerdict::Aborted.code(), 130);
    }

    #[test]
    fn configuration_errors_survive_context() {
        let err: anyhow::Result<()> = Err(RunnerError::Config("bad".into())).context("loading");
        assert_eq!(
            ExitVerdict::from_error(&err.unwrap_err()),
            ExitVerdict::Configuration
        );
        let io = anyhow::anyhow!("disk full");
        assert_eq!(ExitVerdict::from_error(&io), ExitVerdict::ExecutionFailures);
    }
}
