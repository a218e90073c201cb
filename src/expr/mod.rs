//! Boolean conditions over article fields.
//!
//! Used by filter stages and by per-output routing. A condition is compiled
//! once and then evaluated many times, possibly from several dispatch tasks at
//! once, so [`Condition`] is immutable and `Send + Sync`.
//!
//! ```
//! use feedrelay::expr::Condition;
//!
//! let cond = Condition::compile(r#"title contains "Rust" and not ("draft" in tags)"#).unwrap();
//! assert_eq!(cond.to_string(), r#"title contains "Rust" and not ("draft" in tags)"#);
//! ```

mod lexer;
mod parser;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::model::Article;
use parser::{Node, Parser};

/// Errors raised while compiling a condition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    /// Malformed expression text
    #[error("Syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    /// Pattern on the right of `matches` is not a valid regex
    #[error("Invalid regex at {position}: {message}")]
    InvalidRegex { position: usize, message: String },
}

impl ExprError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            position,
            message: message.into(),
        }
    }
}

/// A compiled condition.
#[derive(Clone)]
pub struct Condition {
    source: Arc<str>,
    root: Option<Arc<Node>>,
}

impl Condition {
    /// Compile condition text. Blank text yields an always-true condition.
    pub fn compile(text: &str) -> Result<Self, ExprError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::always());
        }
        let tokens = lexer::tokenize(text)?;
        let root = Parser::new(tokens, text.len()).parse()?;
        Ok(Self {
            source: Arc::from(trimmed),
            root: Some(Arc::new(root)),
        })
    }

    /// The condition that matches every article.
    pub fn always() -> Self {
        Self {
            source: Arc::from(""),
            root: None,
        }
    }

    pub fn matches(&self, article: &Article) -> bool {
        match &self.root {
            Some(root) => root.eval(article),
            None => true,
        }
    }

    pub fn is_always(&self) -> bool {
        self.root.is_none()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&&*self.source).finish()
    }
}
