//! Judge error taxonomy.
//!
//! None of these abort a run: `Unavailable` at construction marks fuzzy
//! substrates as skipped, the rest become field-level failures.

/// Errors raised by a language-model judge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeError {
    /// Judge cannot be used at all (missing credential, bad configuration)
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    #[error("judge timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("judge HTTP error: {0}")]
    Http(String),

    #[error("malformed judge response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for JudgeError {
    fn from(err: reqwest::Error) -> Self {
        JudgeError::Http(err.to_string())
    }
}

/// Result type for judge operations.
pub type JudgeResult<T> = std::result::Result<T, JudgeError>;
