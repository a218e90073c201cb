use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
}

/// Token with its byte offset in the source text.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub(super) fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Spanned { token: Token::LParen, pos });
            }
            ')' => {
                chars.next();
                tokens.push(Spanned { token: Token::RParen, pos });
            }
            '&' | '|' | '=' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        let token = match c {
                            '&' => Token::And,
                            '|' => Token::Or,
                            _ => Token::Eq,
                        };
                        tokens.push(Spanned { token, pos });
                    }
                    _ => return Err(ExprError::syntax(pos, format!("expected '{c}{c}'"))),
                }
            }
            '!' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Spanned { token: Token::Ne, pos });
                } else {
                    tokens.push(Spanned { token: Token::Not, pos });
                }
            }
            '"' | '\'' => {
                chars.next();
                let value = read_string(&mut chars, c, pos)?;
                tokens.push(Spanned { token: Token::Str(value), pos });
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                };
                tokens.push(Spanned { token, pos });
            }
            other => {
                return Err(ExprError::syntax(pos, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    start: usize,
) -> Result<String, ExprError> {
    let mut value = String::new();
    while let Some((pos, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped @ ('\\' | '"' | '\''))) => value.push(escaped),
                // Unknown escapes are kept verbatim so regex classes like \d survive
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(ExprError::syntax(pos, "unterminated escape")),
            },
            c if c == quote => return Ok(value),
            c => value.push(c),
        }
    }
    Err(ExprError::syntax(start, "unterminated string literal"))
}
