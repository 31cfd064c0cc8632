//! Filter expression syntax tree.
//!
//! Trees are immutable once parsed and are shared read-only (`Arc<Expr>`)
//! between concurrent evaluations.

use std::fmt;

use crate::types::Value;

/// Comparison operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive containment / LIKE match.
    Like,
    NotLike,
}

impl CompareOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "~",
            Self::NotLike => "!~",
        }
    }
}

/// A comparison operator plus its multi-value mode.
///
/// `any == false` (plain `=`, `>`, ...) requires every resolved value to
/// match; `any == true` (`?=`, `?>`, ...) requires at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operator {
    pub op: CompareOp,
    pub any: bool,
}

impl Operator {
    #[must_use]
    pub fn all(op: CompareOp) -> Self {
        Self { op, any: false }
    }

    #[must_use]
    pub fn any(op: CompareOp) -> Self {
        Self { op, any: true }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            f.write_str("?")?;
        }
        f.write_str(self.op.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
}

/// Dot-separated identifier path such as `post.owner.id` or `@request.auth.id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub segments: Vec<String>,
}

impl Identifier {
    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a dotted path. No validation; the lexer guarantees well-formed paths.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('.'))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Identifier(Identifier),
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Produced only for an empty rule string; evaluation short-circuits to `true`.
    AlwaysTrue,
    Comparison {
        left: Operand,
        operator: Operator,
        right: Operand,
    },
    /// Two or more children joined by the same operator.
    Logical { op: LogicalOp, children: Vec<Expr> },
    Group(Box<Expr>),
}

impl Expr {
    #[must_use]
    pub fn is_always_true(&self) -> bool {
        matches!(self, Self::AlwaysTrue)
    }

    #[must_use]
    pub fn and(left: Expr, right: Expr) -> Self {
        Self::Logical {
            op: LogicalOp::And,
            children: vec![left, right],
        }
    }

    #[must_use]
    pub fn or(left: Expr, right: Expr) -> Self {
        Self::Logical {
            op: LogicalOp::Or,
            children: vec![left, right],
        }
    }
}
