//! Error types for substrate execution and orchestration.

use std::path::PathBuf;

use conform_core::ConformError;

/// Errors produced by the runner layer.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("substrate {substrate} has an empty command")]
    EmptyCommand { substrate: String },

    #[error("failed to start substrate {substrate}: {source}")]
    Spawn {
        substrate: String,
        #[source]
        source: std::io::Error,
    },

    #[error("substrate {substrate} is locked by another run ({path})")]
    Locked { substrate: String, path: PathBuf },

    #[error("backup of {path} failed: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Conform(#[from] ConformError),

    #[error(transparent)]
    Ledger(#[from] conform_state::LedgerError),
}

impl RunnerError {
    /// True for errors that must stop the run before any substrate executes.
    pub fn is_configuration(&self) -> bool {
        match self {
            RunnerError::Config(_) => true,
            RunnerError::Conform(e) => e.is_configuration(),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Backup {
            path: path.into(),
            source,
        }
    }
}

/// Result type for runner operations.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_classification() {
        assert!(RunnerError::Config("x".into()).is_configuration());
        assert!(RunnerError::from(ConformError::MalformedRulebook("bad".into())).is_configuration());
        assert!(!RunnerError::EmptyCommand {
            substrate: "python".into()
        }
        .is_configuration());
    }
}
