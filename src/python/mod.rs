//! Python source handling: lexing, a statement-level syntax tree, the
//! rewrite passes used to build harnesses and regression tests, and
//! rendering back to source.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod passes;
pub mod printer;

pub use parser::parse_module;
pub use printer::unparse;

use thiserror::Error;

/// Source that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at byte {offset})")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }

    /// 1-based line number of the error within `source`.
    pub fn line(&self, source: &str) -> usize {
        let end = self.offset.min(source.len());
        source.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
    }
}
