use regex::Regex;

use super::lexer::{Spanned, Token};
use super::ExprError;
use crate::model::Article;

/// Fields an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Field {
    Title,
    Link,
    Summary,
    Author,
    Feed,
    Fingerprint,
    Tags,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "title" => Self::Title,
            "link" => Self::Link,
            "summary" => Self::Summary,
            "author" => Self::Author,
            "feed" => Self::Feed,
            "fingerprint" => Self::Fingerprint,
            "tags" => Self::Tags,
            _ => return None,
        })
    }

    fn text<'a>(&self, article: &'a Article) -> &'a str {
        match self {
            Self::Title => &article.title,
            Self::Link => article.link.as_deref().unwrap_or(""),
            Self::Summary => article.summary.as_deref().unwrap_or(""),
            Self::Author => article.author.as_deref().unwrap_or(""),
            Self::Feed => &article.feed_title,
            Self::Fingerprint => &article.fingerprint,
            // Only reachable through `in`, handled separately
            Self::Tags => "",
        }
    }
}

#[derive(Debug, Clone)]
pub(super) enum Operand {
    Field(Field),
    Literal(String),
}

impl Operand {
    fn resolve<'a>(&'a self, article: &'a Article) -> &'a str {
        match self {
            Self::Field(f) => f.text(article),
            Self::Literal(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub(super) enum Node {
    Const(bool),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
    Contains(Operand, Operand),
    StartsWith(Operand, Operand),
    EndsWith(Operand, Operand),
    Matches(Operand, Regex),
    InTags(Operand),
    InText(Operand, Operand),
}

impl Node {
    pub(super) fn eval(&self, article: &Article) -> bool {
        match self {
            Node::Const(b) => *b,
            Node::Not(inner) => !inner.eval(article),
            Node::And(l, r) => l.eval(article) && r.eval(article),
            Node::Or(l, r) => l.eval(article) || r.eval(article),
            Node::Eq(l, r) => l.resolve(article) == r.resolve(article),
            Node::Ne(l, r) => l.resolve(article) != r.resolve(article),
            Node::Contains(l, r) => l.resolve(article).contains(r.resolve(article)),
            Node::StartsWith(l, r) => l.resolve(article).starts_with(r.resolve(article)),
            Node::EndsWith(l, r) => l.resolve(article).ends_with(r.resolve(article)),
            Node::Matches(l, re) => re.is_match(l.resolve(article)),
            Node::InTags(needle) => {
                let needle = needle.resolve(article);
                article.tags.iter().any(|t| t == needle)
            }
            Node::InText(needle, haystack) => {
                haystack.resolve(article).contains(needle.resolve(article))
            }
        }
    }
}

/// Recursive-descent parser over the token stream.
pub(super) struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    end: usize,
}

impl Parser {
    pub(super) fn new(tokens: Vec<Spanned>, src_len: usize) -> Self {
        Self {
            tokens,
            cursor: 0,
            end: src_len,
        }
    }

    pub(super) fn parse(mut self) -> Result<Node, ExprError> {
        let node = self.or()?;
        if let Some(extra) = self.tokens.get(self.cursor) {
            return Err(ExprError::syntax(extra.pos, "unexpected trailing input"));
        }
        Ok(node)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|s| &s.token)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|s| s.pos)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let node = self.or()?;
                match self.advance() {
                    Some(Spanned {
                        token: Token::RParen,
                        ..
                    }) => Ok(node),
                    Some(other) => Err(ExprError::syntax(other.pos, "expected ')'")),
                    None => Err(ExprError::syntax(self.end, "expected ')'")),
                }
            }
            Some(Token::Ident(name)) if name == "true" || name == "false" => {
                let value = name == "true";
                self.advance();
                Ok(Node::Const(value))
            }
            Some(_) => self.comparison(),
            None => Err(ExprError::syntax(self.end, "unexpected end of expression")),
        }
    }

    fn operand(&mut self) -> Result<(Operand, usize), ExprError> {
        let pos = self.pos();
        match self.advance() {
            Some(Spanned {
                token: Token::Str(s),
                ..
            }) => Ok((Operand::Literal(s), pos)),
            Some(Spanned {
                token: Token::Ident(name),
                ..
            }) => Field::parse(&name)
                .map(|f| (Operand::Field(f), pos))
                .ok_or_else(|| ExprError::syntax(pos, format!("unknown field '{name}'"))),
            Some(_) => Err(ExprError::syntax(pos, "expected a field or string literal")),
            None => Err(ExprError::syntax(self.end, "unexpected end of expression")),
        }
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let (lhs, lhs_pos) = self.operand()?;
        let op_pos = self.pos();
        let op = self.advance().ok_or_else(|| {
            ExprError::syntax(self.end, "expected a comparison operator")
        })?;

        let op_name = match &op.token {
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::Ident(name) => match name.as_str() {
                "contains" | "startsWith" | "endsWith" | "matches" | "in" => name.as_str(),
                _ => return Err(ExprError::syntax(op_pos, format!("unknown operator '{name}'"))),
            },
            _ => return Err(ExprError::syntax(op_pos, "expected a comparison operator")),
        }
        .to_string();

        let (rhs, rhs_pos) = self.operand()?;

        if op_name != "in" {
            for (operand, pos) in [(&lhs, lhs_pos), (&rhs, rhs_pos)] {
                if matches!(operand, Operand::Field(Field::Tags)) {
                    return Err(ExprError::syntax(pos, "'tags' can only be used with 'in'"));
                }
            }
        }

        let node = match op_name.as_str() {
            "==" => Node::Eq(lhs, rhs),
            "!=" => Node::Ne(lhs, rhs),
            "contains" => Node::Contains(lhs, rhs),
            "startsWith" => Node::StartsWith(lhs, rhs),
            "endsWith" => Node::EndsWith(lhs, rhs),
            "matches" => {
                let Operand::Literal(pattern) = rhs else {
                    return Err(ExprError::syntax(rhs_pos, "'matches' expects a string pattern"));
                };
                let re = Regex::new(&pattern).map_err(|e| ExprError::InvalidRegex {
                    position: rhs_pos,
                    message: e.to_string(),
                })?;
                Node::Matches(lhs, re)
            }
            _ => match rhs {
                Operand::Field(Field::Tags) => {
                    if matches!(lhs, Operand::Field(Field::Tags)) {
                        return Err(ExprError::syntax(lhs_pos, "'tags' can only be the right operand of 'in'"));
                    }
                    Node::InTags(lhs)
                }
                rhs => {
                    if matches!(lhs, Operand::Field(Field::Tags)) {
                        return Err(ExprError::syntax(lhs_pos, "'tags' can only be the right operand of 'in'"));
                    }
                    Node::InText(lhs, rhs)
                }
            },
        };
        Ok(node)
    }
}
