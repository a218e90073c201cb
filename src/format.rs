//! Message body templates for outputs.
//!
//! Templates use `{field}` placeholders (`{title}`, `{link}`, `{summary}`,
//! `{author}`, `{feed}`, `{published}`, `{tags}`, `{fingerprint}`) and `{{`/`}}`
//! for literal braces.
use thiserror::Error;

use crate::model::Article;

/// Template used when an output does not configure one.
pub const DEFAULT_TEMPLATE: &str = "{title}\n{link}";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormatError {
    /// `{` opened at the given byte offset is never closed
    #[error("Unterminated placeholder at {0}")]
    Unterminated(usize),
    /// A `}` without a matching `{`
    #[error("Unmatched '}}' at {0}")]
    Unmatched(usize),
    /// The template references a field articles do not have
    #[error("Unknown field '{0}' in template")]
    UnknownField(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field(String),
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Formatter {
    template: String,
    segments: Vec<Segment>,
}

impl Formatter {
    /// Parse a template; `None` or blank text selects [`DEFAULT_TEMPLATE`].
    pub fn build(template: Option<&str>) -> Result<Self, FormatError> {
        let template = match template {
            Some(t) if !t.trim().is_empty() => t,
            _ => DEFAULT_TEMPLATE,
        };
        Ok(Self {
            template: template.to_string(),
            segments: parse(template)?,
        })
    }

    /// Effective template text.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn format(&self, article: &Article) -> Result<String, FormatError> {
        let mut out = String::with_capacity(self.template.len() + article.title.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = article
                        .field(name)
                        .ok_or_else(|| FormatError::UnknownField(name.clone()))?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

fn parse(template: &str) -> Result<Vec<Segment>, FormatError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                text.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                text.push('}');
            }
            '}' => return Err(FormatError::Unmatched(pos)),
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, c)) => name.push(c),
                        None => return Err(FormatError::Unterminated(pos)),
                    }
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Field(name.trim().to_string()));
            }
            c => text.push(c),
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}
