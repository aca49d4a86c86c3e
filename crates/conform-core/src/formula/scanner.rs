//! Reference scanner.
//!
//! Finds `{{FieldName}}` references in a formula from its tokens, without
//! building an expression tree. The rulebook and the dependency resolver
//! only need the reference set; braces inside string literals are text,
//! exactly as the evaluator sees them.

use tracing::debug;

use super::lexer::{tokenize, Token};

/// Field names referenced by a formula, in first-occurrence order, without
/// duplicates. Whitespace inside the braces is ignored. A formula that does
/// not tokenize has no references; evaluating it reports the error.
pub fn references(formula: &str) -> Vec<String> {
    let tokens = match tokenize(formula) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(formula, error = %e, "formula does not tokenize, no references");
            return Vec::new();
        }
    };
    let mut out: Vec<String> = Vec::new();
    for token in tokens {
        if let Token::Ref(name) = token {
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}
