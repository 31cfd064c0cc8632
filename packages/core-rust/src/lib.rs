//! `Rulebase` Core: collection schema, records, auth context and the rule
//! filter language with its access resolver.

pub mod access;
pub mod auth;
pub mod context;
pub mod error;
pub mod filter;
pub mod record;
pub mod schema;
pub mod traits;
pub mod types;

#[cfg(test)]
mod test_support;

pub use access::{can_perform, AccessDecision, CompiledRules, Rule, RuleOperation};
pub use auth::{Admin, AuthContext, AuthKind, Identity};
pub use context::RequestContext;
pub use error::{EvalError, RuleError, RuleName, SchemaError, SyntaxError};
pub use filter::{parse, Evaluator, Expr};
pub use record::{Record, RecordAction, RecordEvent};
pub use schema::{Collection, CollectionType, FieldDef, FieldType, RuleSet, ValidationResult};
pub use traits::{CollectionProvider, RecordProvider};
pub use types::Value;
