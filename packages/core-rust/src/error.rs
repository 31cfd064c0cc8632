//! Error types shared by the filter language, schema validation and evaluation.

use std::fmt;

/// A rule string failed to tokenize or parse.
///
/// `position` is a byte offset into the rule string. Errors at end of input
/// report the input length.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error at position {position}: {reason}")]
pub struct SyntaxError {
    pub position: usize,
    pub reason: String,
}

impl SyntaxError {
    #[must_use]
    pub fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

/// Which of the five collection rules an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleName {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl RuleName {
    /// Wire/JSON name of the rule (`listRule`, `viewRule`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "listRule",
            Self::View => "viewRule",
            Self::Create => "createRule",
            Self::Update => "updateRule",
            Self::Delete => "deleteRule",
        }
    }
}

impl fmt::Display for RuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collection rule that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {rule}: {source}")]
pub struct RuleError {
    pub rule: RuleName,
    #[source]
    pub source: SyntaxError,
}

/// Reasons a collection definition is rejected at save time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid collection name {0:?}")]
    InvalidName(String),
    #[error("invalid field name {0:?}")]
    InvalidFieldName(String),
    #[error("duplicate field {0:?}")]
    DuplicateField(String),
    #[error("field {0:?} is reserved for system use")]
    ReservedField(String),
    #[error("relation field {field:?} targets unknown collection {target:?}")]
    UnknownRelationTarget { field: String, target: String },
    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Failures while evaluating a rule.
///
/// Semantically absent data never produces an error (it folds to `false`);
/// only collaborator failures surface here.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("record lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}
