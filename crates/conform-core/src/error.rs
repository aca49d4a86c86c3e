//! Error taxonomy for rulebook loading, evaluation and grading.
//!
//! Configuration errors (malformed rulebook, cyclic formulas, formula syntax)
//! must halt a run before any substrate executes. Value mismatches are never
//! errors; they are grading output.

use std::path::PathBuf;

/// Errors raised while compiling or evaluating a formula.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated {what} starting at offset {offset}")]
    Unterminated { what: &'static str, offset: usize },

    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("unknown function {name}")]
    UnknownFunction { name: String },

    #[error("{function} takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("integer literal out of range: {literal}")]
    IntegerRange { literal: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("arithmetic overflow in {op}")]
    Overflow { op: &'static str },

    #[error("division by zero")]
    DivisionByZero,

    #[error("reference to undeclared field {name}")]
    UnknownField { name: String },
}

/// Core domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ConformError {
    #[error("malformed rulebook: {0}")]
    MalformedRulebook(String),

    #[error("cyclic formula in {entity}: {}", fields.join(" -> "))]
    CyclicFormula { entity: String, fields: Vec<String> },

    #[error("formula for {entity}.{field} does not compile: {source}")]
    Formula {
        entity: String,
        field: String,
        #[source]
        source: FormulaError,
    },

    #[error("evaluating {entity}.{field} for record {key}: {source}")]
    Evaluation {
        entity: String,
        field: String,
        key: String,
        #[source]
        source: FormulaError,
    },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConformError {
    /// True when the ground truth itself cannot be trusted and the run must halt.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConformError::MalformedRulebook(_)
                | ConformError::CyclicFormula { .. }
                | ConformError::Formula { .. }
                | ConformError::Evaluation { .. }
                | ConformError::UnknownEntity(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConformError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading substrate output for grading.
#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("malformed output in {path}: {reason}")]
    MalformedOutput { path: PathBuf, reason: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for core operations.
pub type ConformResult<T> = std::result::Result<T, ConformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_error_names_the_path() {
        let err = ConformError::CyclicFormula {
            entity: "Widgets".into(),
            fields: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic formula in Widgets: A -> B -> A");
        assert!(err.is_configuration());
    }

    #[test]
    fn io_is_not_configuration() {
        let err = ConformError::io("/tmp/x", std::io::Error::other("boom"));
        assert!(!err.is_configuration());
    }
}
