//! Rule resolution: which of a collection's five rules applies and whether it
//! lets the caller through.

use std::sync::Arc;

use tracing::debug;

use crate::error::{EvalError, RuleError, RuleName, SyntaxError};
use crate::filter::{parse, Evaluator, Expr};
use crate::record::Record;
use crate::schema::Collection;

/// The five record operations a collection gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOperation {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl RuleOperation {
    #[must_use]
    pub fn rule_name(self) -> RuleName {
        match self {
            Self::List => RuleName::List,
            Self::View => RuleName::View,
            Self::Create => RuleName::Create,
            Self::Update => RuleName::Update,
            Self::Delete => RuleName::Delete,
        }
    }
}

/// A compiled collection rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// No rule configured: only admins may perform the operation.
    Absent,
    /// A parsed rule; [`Expr::AlwaysTrue`] when the rule string was empty.
    Expression(Arc<Expr>),
}

impl Rule {
    /// Compiles the stored form of a rule.
    ///
    /// # Errors
    ///
    /// Returns the parser's error when the rule string is malformed.
    pub fn parse(source: Option<&str>) -> Result<Self, SyntaxError> {
        match source {
            None => Ok(Self::Absent),
            Some(rule) => Ok(Self::Expression(Arc::new(parse(rule)?))),
        }
    }
}

/// All five rules of one collection, parsed once and shared.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRules {
    pub list: Rule,
    pub view: Rule,
    pub create: Rule,
    pub update: Rule,
    pub delete: Rule,
}

impl CompiledRules {
    /// Parses every rule of `collection`.
    ///
    /// # Errors
    ///
    /// Returns the first rule that fails to parse, tagged with its name.
    pub fn compile(collection: &Collection) -> Result<Self, RuleError> {
        let rules = &collection.rules;
        let compile = |rule: RuleName, source: &Option<String>| {
            Rule::parse(source.as_deref()).map_err(|source| RuleError { rule, source })
        };
        Ok(Self {
            list: compile(RuleName::List, &rules.list_rule)?,
            view: compile(RuleName::View, &rules.view_rule)?,
            create: compile(RuleName::Create, &rules.create_rule)?,
            update: compile(RuleName::Update, &rules.update_rule)?,
            delete: compile(RuleName::Delete, &rules.delete_rule)?,
        })
    }

    #[must_use]
    pub fn rule(&self, operation: RuleOperation) -> &Rule {
        match operation {
            RuleOperation::List => &self.list,
            RuleOperation::View => &self.view,
            RuleOperation::Create => &self.create,
            RuleOperation::Update => &self.update,
            RuleOperation::Delete => &self.delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny,
}

impl AccessDecision {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

impl From<bool> for AccessDecision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::Allow
        } else {
            Self::Deny
        }
    }
}

/// Decides whether the evaluator's caller may perform `operation`.
///
/// Admins are always allowed; an absent rule denies everyone else; an empty
/// rule allows everyone without evaluating anything.
///
/// # Errors
///
/// Propagates provider failures from the evaluator.
pub async fn can_perform(
    collection: &Arc<Collection>,
    rules: &CompiledRules,
    operation: RuleOperation,
    record: Option<&Record>,
    evaluator: &Evaluator<'_>,
) -> Result<AccessDecision, EvalError> {
    if evaluator.request().auth.is_admin() {
        return Ok(AccessDecision::Allow);
    }

    let expr = match rules.rule(operation) {
        Rule::Absent => {
            debug!(
                collection = %collection.name,
                rule = %operation.rule_name(),
                "rule absent, admin only"
            );
            return Ok(AccessDecision::Deny);
        }
        Rule::Expression(expr) if expr.is_always_true() => return Ok(AccessDecision::Allow),
        Rule::Expression(expr) => expr,
    };

    let allowed = evaluator.evaluate(expr, collection, record).await?;
    Ok(allowed.into())
}
