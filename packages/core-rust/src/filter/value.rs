//! Typed comparison scalars and the coercion rules between them.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::RegexBuilder;

use super::ast::CompareOp;
use crate::schema::{parse_datetime, FieldType};
use crate::types::Value;

/// A single comparable value produced by resolving an operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
}

impl Scalar {
    /// Converts a stored field value using the field's declared type.
    ///
    /// Arrays fan out into one scalar per element; an empty array yields no
    /// scalars. Objects outside `json` fields yield nothing.
    #[must_use]
    pub fn from_field(field_type: &FieldType, value: &Value) -> Vec<Scalar> {
        match value {
            Value::Array(items) => items
                .iter()
                .flat_map(|item| Self::from_field(field_type, item))
                .collect(),
            Value::Map(_) => Vec::new(),
            Value::Null => vec![Self::Null],
            single => vec![Self::typed(field_type, single)],
        }
    }

    /// Converts an untyped value (literal, request parameter, claim).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_value(value: &Value) -> Vec<Scalar> {
        match value {
            Value::Null => vec![Self::Null],
            Value::Bool(b) => vec![Self::Bool(*b)],
            Value::Int(n) => vec![Self::Number(*n as f64)],
            Value::Float(n) => vec![Self::Number(*n)],
            Value::String(s) => vec![Self::Text(s.clone())],
            Value::Array(items) => items.iter().flat_map(Self::from_value).collect(),
            Value::Map(_) => Vec::new(),
        }
    }

    fn typed(field_type: &FieldType, value: &Value) -> Scalar {
        match (field_type, value) {
            (FieldType::Number, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) => Self::Number(n),
                Err(_) if s.is_empty() => Self::Null,
                Err(_) => Self::Text(s.clone()),
            },
            (FieldType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Self::Bool(true),
                "false" => Self::Bool(false),
                _ => Self::Text(s.clone()),
            },
            (FieldType::Date, Value::String(s)) => match parse_datetime(s) {
                Some(dt) => Self::Date(dt),
                None if s.is_empty() => Self::Null,
                None => Self::Text(s.clone()),
            },
            _ => Self::from_value(value).pop().unwrap_or(Self::Null),
        }
    }

    fn is_null_like(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Date(dt) => Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

/// Applies one comparison operator to a pair of scalars.
///
/// Pairs that cannot be compared yield `false` for every operator.
#[must_use]
pub fn compare(left: &Scalar, op: CompareOp, right: &Scalar) -> bool {
    match op {
        CompareOp::Eq => equals(left, right) == Some(true),
        CompareOp::Neq => equals(left, right) == Some(false),
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            ordering(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            ordering(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Like => like(left, right) == Some(true),
        CompareOp::NotLike => like(left, right) == Some(false),
    }
}

/// `null` and `""` are interchangeable and equal only to each other.
fn equals(left: &Scalar, right: &Scalar) -> Option<bool> {
    if left.is_null_like() || right.is_null_like() {
        return Some(left.is_null_like() && right.is_null_like());
    }
    ordering(left, right).map(|o| o == Ordering::Equal)
}

fn ordering(left: &Scalar, right: &Scalar) -> Option<Ordering> {
    use Scalar::{Bool, Date, Number, Text};

    match (left, right) {
        (Number(a), Number(b)) => a.partial_cmp(b),
        (Number(a), Text(s)) => s.trim().parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
        (Text(s), Number(b)) => s.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
        (Text(a), Text(b)) => Some(a.cmp(b)),
        (Date(a), Date(b)) => Some(a.cmp(b)),
        (Date(a), Text(s)) => parse_datetime(s).map(|b| a.cmp(&b)),
        (Text(s), Date(b)) => parse_datetime(s).map(|a| a.cmp(b)),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Bool(a), Text(s)) => parse_bool(s).map(|b| a.cmp(&b)),
        (Text(s), Bool(b)) => parse_bool(s).map(|a| a.cmp(b)),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Case-insensitive containment; a `%` in the pattern switches to LIKE
/// matching where `%` stands for any run of characters.
fn like(value: &Scalar, pattern: &Scalar) -> Option<bool> {
    let value = value.as_text()?;
    let pattern = pattern.as_text()?;

    if !pattern.contains('%') {
        return Some(value.to_lowercase().contains(&pattern.to_lowercase()));
    }

    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let re = RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .ok()?;
    Some(re.is_match(&value))
}
