//! Arithmetic expression validation and evaluation.
//!
//! Input is user text from a chat, so nothing here interprets anything beyond a
//! tiny grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | primary
//! primary := NUMBER | '(' expr ')'
//! ```
//!
//! Numbers are exact decimals. Length and nesting are capped so the cost of a
//! single message is bounded.

use std::{str::FromStr, sync::OnceLock};

use regex::Regex;
use rust_decimal::Decimal;

/// Longest accepted expression (after the running total is prepended).
pub const MAX_EXPRESSION_LEN: usize = 256;

/// Deepest accepted nesting of parentheses and unary signs.
pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("expression spans multiple lines")]
    MultiLine,
    #[error("expression has no arithmetic operator")]
    NoOperator,
    #[error("character {0:?} is not allowed")]
    InvalidCharacter(char),
    #[error("expression longer than {MAX_EXPRESSION_LEN} characters")]
    TooLong,
    #[error("no previous total to continue from")]
    NoPreviousTotal,
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected {found:?} at offset {offset}")]
    UnexpectedToken { found: char, offset: usize },
    #[error("missing closing parenthesis")]
    UnclosedParen,
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("numeric overflow")]
    Overflow,
}

/// Whether the text stands on its own or continues from the running total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpressionKind {
    Standalone,
    Continuation,
}

/// Text that passed validation but has not been evaluated yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub text: &'a str,
    pub kind: ExpressionKind,
}

/// A fully evaluated expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Exact string that was evaluated (including any prepended total).
    pub expression: String,
    pub value: Decimal,
    pub kind: ExpressionKind,
}

fn operator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[+\-*/]").expect("valid regex"))
}

fn allowed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9+\-*/().\s]+$").expect("valid regex"))
}

/// Check raw message text against the arithmetic shape rules.
///
/// This never looks at the running total; continuation handling happens in [`resolve`].
pub fn validate(raw: &str) -> Result<Candidate<'_>, ExprError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ExprError::Empty);
    }
    if text.contains('\n') || text.contains('\r') {
        return Err(ExprError::MultiLine);
    }
    if !operator_re().is_match(text) {
        return Err(ExprError::NoOperator);
    }
    if !allowed_re().is_match(text) {
        let bad = text
            .chars()
            .find(|c| !is_allowed_char(*c))
            .unwrap_or('?');
        return Err(ExprError::InvalidCharacter(bad));
    }
    if text.len() > MAX_EXPRESSION_LEN {
        return Err(ExprError::TooLong);
    }

    let kind = if text.starts_with(['+', '-', '*', '/']) {
        ExpressionKind::Continuation
    } else {
        ExpressionKind::Standalone
    };
    Ok(Candidate { text, kind })
}

/// Validate, expand continuations against `current_total`, and evaluate.
pub fn resolve(raw: &str, current_total: Option<Decimal>) -> Result<Resolved, ExprError> {
    let candidate = validate(raw)?;
    let expression = match candidate.kind {
        ExpressionKind::Standalone => candidate.text.to_string(),
        ExpressionKind::Continuation => {
            let total = current_total.ok_or(ExprError::NoPreviousTotal)?;
            format!("{}{}", plain_number(total), candidate.text)
        }
    };
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(ExprError::TooLong);
    }

    let value = evaluate(&expression)?;
    Ok(Resolved {
        expression,
        value,
        kind: candidate.kind,
    })
}

/// Render a total the way it is spliced in front of a continuation (`10.5`, `-3`).
pub fn plain_number(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Evaluate an arithmetic expression over exact decimals.
pub fn evaluate(expr: &str) -> Result<Decimal, ExprError> {
    let mut parser = Parser {
        src: expr,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if let Some(c) = parser.peek() {
        return Err(ExprError::UnexpectedToken {
            found: c,
            offset: parser.pos,
        });
    }
    Ok(value)
}

/// Whitespace for both validation and parsing. Unicode, so a no-break space
/// separates tokens like a plain one.
fn is_space(c: char) -> bool {
    c.is_whitespace()
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_digit() || is_space(c) || "+-*/().".contains(c)
}

/// Cursor over the expression; `pos` is a byte offset on a char boundary.
struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self, c: char) {
        self.pos += c.len_utf8();
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| is_space(*c)) {
            self.bump(c);
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Decimal, ExprError> {
        let mut acc = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    acc = acc.checked_add(rhs).ok_or(ExprError::Overflow)?;
                }
                Some('-') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    acc = acc.checked_sub(rhs).ok_or(ExprError::Overflow)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<Decimal, ExprError> {
        let mut acc = self.unary()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    acc = acc.checked_mul(rhs).ok_or(ExprError::Overflow)?;
                }
                Some('/') => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs.is_zero() {
                        return Err(ExprError::DivisionByZero);
                    }
                    acc = acc.checked_div(rhs).ok_or(ExprError::Overflow)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn unary(&mut self) -> Result<Decimal, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(sign @ ('+' | '-')) => {
                self.pos += 1;
                self.descend()?;
                let v = self.unary()?;
                self.depth -= 1;
                Ok(if sign == '-' { -v } else { v })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Decimal, ExprError> {
        self.skip_ws();
        match self.peek() {
            None => Err(ExprError::UnexpectedEnd),
            Some('(') => {
                self.pos += 1;
                self.descend()?;
                let v = self.expr()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(ExprError::UnclosedParen);
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(v)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(ExprError::UnexpectedToken {
                found: c,
                offset: self.pos,
            }),
        }
    }

    fn number(&mut self) -> Result<Decimal, ExprError> {
        let start = self.pos;
        let mut digits = 0usize;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
            } else {
                break;
            }
            self.pos += 1;
        }

        let lit = &self.src[start..self.pos];
        if digits == 0 {
            return Err(ExprError::InvalidNumber(lit.to_string()));
        }

        // Decimal parsing wants digits on both sides of the point.
        let mut normalized = lit.trim_end_matches('.').to_string();
        if normalized.starts_with('.') {
            normalized.insert(0, '0');
        }
        Decimal::from_str(&normalized).map_err(|_| ExprError::InvalidNumber(lit.to_string()))
    }
}
