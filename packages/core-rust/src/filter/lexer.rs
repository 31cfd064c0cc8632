//! Tokenizer for filter expressions.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use super::ast::{CompareOp, Operator};
use crate::error::SyntaxError;
use crate::types::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Dotted identifier path, kept as written.
    Identifier(String),
    /// String, number, boolean or null literal.
    Literal(Value),
    Operator(Operator),
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier(name) => write!(f, "identifier {name:?}"),
            Self::Literal(Value::String(s)) => write!(f, "string {s:?}"),
            Self::Literal(Value::Int(n)) => write!(f, "number {n}"),
            Self::Literal(Value::Float(n)) => write!(f, "number {n}"),
            Self::Literal(Value::Bool(b)) => write!(f, "{b}"),
            Self::Literal(_) => f.write_str("null"),
            Self::Operator(op) => write!(f, "operator '{op}'"),
            Self::And => f.write_str("'&&'"),
            Self::Or => f.write_str("'||'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character of the token.
    pub position: usize,
}

/// Splits a rule string into tokens.
///
/// # Errors
///
/// Returns a [`SyntaxError`] pointing at the first character that cannot
/// start or continue a token.
pub fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer {
        input,
        chars: input.char_indices().peekable(),
    }
    .run()
}

struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();

        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }

            let kind = match c {
                '(' => {
                    self.chars.next();
                    TokenKind::LParen
                }
                ')' => {
                    self.chars.next();
                    TokenKind::RParen
                }
                '&' => {
                    self.chars.next();
                    self.expect_char('&', pos, "expected '&&'")?;
                    TokenKind::And
                }
                '|' => {
                    self.chars.next();
                    self.expect_char('|', pos, "expected '||'")?;
                    TokenKind::Or
                }
                '/' if self.input[pos..].starts_with("//") => {
                    self.skip_line();
                    continue;
                }
                '?' => {
                    self.chars.next();
                    let op = self.compare_op(pos + 1)?;
                    TokenKind::Operator(Operator::any(op))
                }
                '=' | '!' | '<' | '>' | '~' => {
                    let op = self.compare_op(pos)?;
                    TokenKind::Operator(Operator::all(op))
                }
                '\'' | '"' => TokenKind::Literal(Value::String(self.string(pos, c)?)),
                '-' | '0'..='9' => TokenKind::Literal(self.number(pos)?),
                c if c.is_ascii_alphabetic() || c == '_' || c == '@' => self.word(pos)?,
                other => {
                    return Err(SyntaxError::new(pos, format!("unexpected character {other:?}")));
                }
            };

            tokens.push(Token {
                kind,
                position: pos,
            });
        }

        Ok(tokens)
    }

    fn expect_char(&mut self, expected: char, pos: usize, reason: &str) -> Result<(), SyntaxError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(SyntaxError::new(pos, reason)),
        }
    }

    fn skip_line(&mut self) {
        for (_, c) in self.chars.by_ref() {
            if c == '\n' {
                break;
            }
        }
    }

    fn compare_op(&mut self, pos: usize) -> Result<CompareOp, SyntaxError> {
        let Some((_, first)) = self.chars.next() else {
            return Err(SyntaxError::new(pos, "expected comparison operator after '?'"));
        };
        let next_is = |lexer: &mut Self, expected: char| {
            if lexer.chars.peek().is_some_and(|&(_, c)| c == expected) {
                lexer.chars.next();
                true
            } else {
                false
            }
        };
        let op = match first {
            '=' => CompareOp::Eq,
            '~' => CompareOp::Like,
            '>' if next_is(self, '=') => CompareOp::Gte,
            '>' => CompareOp::Gt,
            '<' if next_is(self, '=') => CompareOp::Lte,
            '<' => CompareOp::Lt,
            '!' if next_is(self, '=') => CompareOp::Neq,
            '!' if next_is(self, '~') => CompareOp::NotLike,
            _ => return Err(SyntaxError::new(pos, "invalid comparison operator")),
        };
        Ok(op)
    }

    fn string(&mut self, pos: usize, quote: char) -> Result<String, SyntaxError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(SyntaxError::new(pos, "unterminated string literal")),
                Some((_, c)) if c == quote => return Ok(out),
                Some((esc_pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, c)) => out.push(c),
                    None => {
                        return Err(SyntaxError::new(esc_pos, "unterminated escape sequence"));
                    }
                },
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn number(&mut self, pos: usize) -> Result<Value, SyntaxError> {
        let mut end = pos;
        let mut seen_dot = false;
        while let Some(&(i, c)) = self.chars.peek() {
            let sign = c == '-' && i == pos;
            let dot = c == '.' && !seen_dot;
            if !(c.is_ascii_digit() || sign || dot) {
                break;
            }
            seen_dot |= dot;
            end = i + c.len_utf8();
            self.chars.next();
        }
        let text = &self.input[pos..end];
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Value::Int(n));
        }
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Value::Float(n)),
            _ => Err(SyntaxError::new(pos, format!("invalid number {text:?}"))),
        }
    }

    fn word(&mut self, pos: usize) -> Result<TokenKind, SyntaxError> {
        let mut end = pos;
        while let Some(&(i, c)) = self.chars.peek() {
            let at_start = c == '@' && (i == pos || self.input[..i].ends_with('.'));
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || at_start) {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        let word = &self.input[pos..end];

        match word {
            "true" => return Ok(TokenKind::Literal(Value::Bool(true))),
            "false" => return Ok(TokenKind::Literal(Value::Bool(false))),
            "null" => return Ok(TokenKind::Literal(Value::Null)),
            _ => {}
        }

        let mut offset = pos;
        for (index, segment) in word.split('.').enumerate() {
            if segment.is_empty() {
                return Err(SyntaxError::new(offset, "empty identifier segment"));
            }
            let body = if index == 0 {
                segment.strip_prefix('@').unwrap_or(segment)
            } else {
                segment
            };
            if body.is_empty() || body.contains('@') {
                return Err(SyntaxError::new(offset, format!("invalid identifier {word:?}")));
            }
            offset += segment.len() + 1;
        }

        Ok(TokenKind::Identifier(word.to_string()))
    }
}
