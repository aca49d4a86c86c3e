//! Formula language: placeholder scanner, tokenizer, parser and evaluator.
//!
//! Formulas are compiled once into an [`Expr`] tree; evaluation is a pure
//! function of the tree and a [`Bindings`] implementation.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod scanner;

pub use eval::{truthy, values_equal, Bindings};
pub use parser::{BinOp, Expr, Func};

use crate::error::FormulaError;
use crate::value::Value;

/// A compiled formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn compile(source: &str) -> Result<Self, FormulaError> {
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(&tokens)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn eval(&self, env: &dyn Bindings) -> Result<Value, FormulaError> {
        eval::eval(&self.expr, env)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}
