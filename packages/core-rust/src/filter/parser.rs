//! Recursive-descent parser for filter expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := primary ( "&&" primary )*
//! primary    := "(" or ")" | comparison
//! comparison := operand OPERATOR operand
//! operand    := IDENTIFIER | LITERAL
//! ```

use super::ast::{Expr, Identifier, LogicalOp, Operand, Operator};
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::SyntaxError;

/// Parenthesis nesting limit; keeps hostile input from exhausting the stack.
const MAX_DEPTH: usize = 64;

/// Parses a rule string into an expression tree.
///
/// Empty or whitespace-only input yields [`Expr::AlwaysTrue`].
///
/// # Errors
///
/// Returns a [`SyntaxError`] with the byte offset of the offending token, or
/// the input length when the input ends early.
pub fn parse(input: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(Expr::AlwaysTrue);
    }

    let mut parser = Parser {
        tokens,
        index: 0,
        end: input.len(),
        depth: 0,
    };
    let expr = parser.or_expr()?;
    if let Some(token) = parser.peek() {
        return Err(SyntaxError::new(
            token.position,
            format!("unexpected {}", token.kind),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, reason: &str) -> SyntaxError {
        match self.peek() {
            Some(token) => SyntaxError::new(
                token.position,
                format!("{reason}, found {}", token.kind),
            ),
            None => SyntaxError::new(self.end, format!("{reason}, found end of input")),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut children = vec![self.and_expr()?];
        while self.eat(&TokenKind::Or) {
            children.push(self.and_expr()?);
        }
        Ok(collapse(LogicalOp::Or, children))
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut children = vec![self.primary()?];
        while self.eat(&TokenKind::And) {
            children.push(self.primary()?);
        }
        Ok(collapse(LogicalOp::And, children))
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            let open = self.index;
            if self.depth >= MAX_DEPTH {
                return Err(SyntaxError::new(
                    self.tokens[open].position,
                    "expression nested too deeply",
                ));
            }
            self.index += 1;
            self.depth += 1;
            let inner = self.or_expr()?;
            if !self.eat(&TokenKind::RParen) {
                return Err(self.error_here("expected ')'"));
            }
            self.depth -= 1;
            return Ok(Expr::Group(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.operand()?;
        let operator = self.operator()?;
        let right = self.operand()?;
        Ok(Expr::Comparison {
            left,
            operator,
            right,
        })
    }

    fn operand(&mut self) -> Result<Operand, SyntaxError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Identifier(_) | TokenKind::Literal(_)) => {}
            _ => return Err(self.error_here("expected identifier or literal")),
        }
        match self.next().map(|t| t.kind) {
            Some(TokenKind::Identifier(path)) => Ok(Operand::Identifier(Identifier::parse(&path))),
            Some(TokenKind::Literal(value)) => Ok(Operand::Literal(value)),
            _ => unreachable!("operand token checked above"),
        }
    }

    fn operator(&mut self) -> Result<Operator, SyntaxError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Operator(op)) => {
                let op = *op;
                self.index += 1;
                Ok(op)
            }
            _ => Err(self.error_here("expected comparison operator")),
        }
    }
}

fn collapse(op: LogicalOp, mut children: Vec<Expr>) -> Expr {
    if children.len() == 1 {
        children.remove(0)
    } else {
        Expr::Logical { op, children }
    }
}
