//! # Map Expressions
//!
//! The transform a map applies to each update: `y = x * 100`,
//! `k = x[0]; y = k > 0 ? k : -k`, ...
//!
//! `x` is the updating source vector and `y` the destination vector. Values
//! are evaluated in f64 and narrowed into the destination type afterwards.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;

use std::fmt;

use crate::Result;

/// A parsed, ready-to-run expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    program: ast::Program,
}

impl Expression {
    pub fn source(&self) -> &str { &self.source }
    pub fn program(&self) -> &ast::Program { &self.program }

    /// Evaluate against source vector `x`, producing at least `out_len`
    /// elements when the result is a scalar.
    pub fn evaluate(&self, x: &[f64], out_len: usize) -> Result<Vec<f64>> {
        eval::evaluate(&self.program, x, out_len)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse an expression, rejecting nesting deeper than `max_depth`.
pub fn parse(source: &str, max_depth: usize) -> Result<Expression> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse(&tokens, max_depth)?;
    Ok(Expression { source: source.to_owned(), program })
}
