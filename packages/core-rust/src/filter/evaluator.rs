//! Asynchronous evaluation of filter expressions against a record.
//!
//! Evaluation is fail-closed: an identifier that cannot be resolved (unknown
//! field, non-relation in the middle of a path, missing collection) makes its
//! comparison `false` instead of aborting. Only collaborator failures from the
//! schema or record providers surface as [`EvalError`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::trace;

use super::ast::{Expr, LogicalOp, Operand, Operator};
use super::value::{compare, Scalar};
use crate::auth::Identity;
use crate::context::RequestContext;
use crate::error::EvalError;
use crate::record::{relation_ids, Record};
use crate::schema::{Collection, FieldType};
use crate::traits::{CollectionProvider, RecordProvider};
use crate::types::Value;

type BoxFuture<'b, T> = Pin<Box<dyn Future<Output = T> + Send + 'b>>;

/// Values an operand resolved to.
#[derive(Debug)]
enum Resolved {
    /// The path does not exist in the schema; the comparison is `false`.
    Gap,
    Values {
        items: Vec<Scalar>,
        /// Cross-collection lookups always use any-of matching.
        existence: bool,
    },
}

impl Resolved {
    fn values(items: Vec<Scalar>) -> Self {
        Self::Values {
            items,
            existence: false,
        }
    }

    fn null() -> Self {
        Self::values(vec![Scalar::Null])
    }
}

/// Evaluates expressions for one request.
///
/// Cheap to construct; borrows its collaborators for the request's lifetime.
pub struct Evaluator<'a> {
    collections: &'a dyn CollectionProvider,
    records: &'a dyn RecordProvider,
    request: &'a RequestContext,
}

impl<'a> Evaluator<'a> {
    #[must_use]
    pub fn new(
        collections: &'a dyn CollectionProvider,
        records: &'a dyn RecordProvider,
        request: &'a RequestContext,
    ) -> Self {
        Self {
            collections,
            records,
            request,
        }
    }

    #[must_use]
    pub fn request(&self) -> &RequestContext {
        self.request
    }

    /// Evaluates `expr` for `record` of `collection`.
    ///
    /// `record` may be `None` when no record is in scope; bare field
    /// identifiers then resolve to nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Lookup`] when a provider fails.
    pub async fn evaluate(
        &self,
        expr: &Expr,
        collection: &Arc<Collection>,
        record: Option<&Record>,
    ) -> Result<bool, EvalError> {
        self.eval(expr, collection, record).await
    }

    fn eval<'b>(
        &'b self,
        expr: &'b Expr,
        collection: &'b Arc<Collection>,
        record: Option<&'b Record>,
    ) -> BoxFuture<'b, Result<bool, EvalError>> {
        Box::pin(async move {
            match expr {
                Expr::AlwaysTrue => Ok(true),
                Expr::Group(inner) => self.eval(inner, collection, record).await,
                Expr::Logical {
                    op: LogicalOp::And,
                    children,
                } => {
                    for child in children {
                        if !self.eval(child, collection, record).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Expr::Logical {
                    op: LogicalOp::Or,
                    children,
                } => {
                    for child in children {
                        if self.eval(child, collection, record).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Expr::Comparison {
                    left,
                    operator,
                    right,
                } => {
                    self.comparison(left, *operator, right, collection, record)
                        .await
                }
            }
        })
    }

    async fn comparison(
        &self,
        left: &Operand,
        operator: Operator,
        right: &Operand,
        collection: &Arc<Collection>,
        record: Option<&Record>,
    ) -> Result<bool, EvalError> {
        let left = self.operand(left, collection, record).await?;
        let right = self.operand(right, collection, record).await?;

        let (
            Resolved::Values {
                items: lhs,
                existence: left_exists,
            },
            Resolved::Values {
                items: rhs,
                existence: right_exists,
            },
        ) = (left, right)
        else {
            return Ok(false);
        };
        if lhs.is_empty() || rhs.is_empty() {
            return Ok(false);
        }

        let mut pairs = lhs
            .iter()
            .flat_map(|l| rhs.iter().map(move |r| (l, r)));
        let matched = if operator.any || left_exists || right_exists {
            pairs.any(|(l, r)| compare(l, operator.op, r))
        } else {
            pairs.all(|(l, r)| compare(l, operator.op, r))
        };
        Ok(matched)
    }

    async fn operand(
        &self,
        operand: &Operand,
        collection: &Arc<Collection>,
        record: Option<&Record>,
    ) -> Result<Resolved, EvalError> {
        let ident = match operand {
            Operand::Literal(value) => return Ok(Resolved::values(Scalar::from_value(value))),
            Operand::Identifier(ident) => ident,
        };

        let resolved = match ident.segments.split_first() {
            Some((head, rest)) if head == "@request" => {
                self.request_path(rest, collection).await?
            }
            Some((head, rest)) if head == "@collection" => self.collection_path(rest).await?,
            Some((head, _)) if head.starts_with('@') => Resolved::Gap,
            Some(_) => match record {
                Some(record) => {
                    self.record_path(Arc::clone(collection), vec![record.clone()], &ident.segments)
                        .await?
                }
                None => Resolved::Gap,
            },
            None => Resolved::Gap,
        };

        if matches!(resolved, Resolved::Gap) {
            trace!(identifier = %ident, collection = %collection.name, "unresolvable identifier");
        }
        Ok(resolved)
    }

    /// Walks `segments` starting from `records` of `schema`.
    ///
    /// Non-terminal segments must be relation fields (followed through the
    /// record provider) or json fields (indexed with the remaining segments).
    async fn record_path(
        &self,
        mut schema: Arc<Collection>,
        mut records: Vec<Record>,
        segments: &[String],
    ) -> Result<Resolved, EvalError> {
        for (i, segment) in segments.iter().enumerate() {
            let Some(field_type) = schema.field_type(segment) else {
                return Ok(Resolved::Gap);
            };

            if i + 1 == segments.len() {
                let items = records
                    .iter()
                    .flat_map(|r| Scalar::from_field(&field_type, &r.field(segment).unwrap_or_default()))
                    .collect();
                return Ok(Resolved::values(items));
            }

            match field_type {
                FieldType::Relation { collection, .. } => {
                    let Some(target) = self.collections.find_collection(&collection).await? else {
                        return Ok(Resolved::Gap);
                    };
                    let ids: Vec<String> = records
                        .iter()
                        .flat_map(|r| r.relation_ids(segment))
                        .collect();
                    if ids.is_empty() {
                        return Ok(Resolved::values(Vec::new()));
                    }
                    records = self.records.find_records(&target.name, &ids).await?;
                    if records.is_empty() {
                        return Ok(Resolved::values(Vec::new()));
                    }
                    schema = target;
                }
                FieldType::Json => {
                    let rest = &segments[i + 1..];
                    let items = records
                        .iter()
                        .flat_map(|r| {
                            let value = r.field(segment).unwrap_or_default();
                            Scalar::from_value(&json_path(&value, rest))
                        })
                        .collect();
                    return Ok(Resolved::values(items));
                }
                _ => return Ok(Resolved::Gap),
            }
        }
        Ok(Resolved::Gap)
    }

    async fn request_path(
        &self,
        segments: &[String],
        collection: &Arc<Collection>,
    ) -> Result<Resolved, EvalError> {
        let request = self.request;
        let Some((section, rest)) = segments.split_first() else {
            return Ok(Resolved::Gap);
        };

        match section.as_str() {
            "method" if rest.is_empty() => {
                Ok(Resolved::values(vec![Scalar::Text(request.method.clone())]))
            }
            "query" => Ok(map_path(&request.query, rest)),
            "headers" => Ok(map_path(&request.headers, rest)),
            "data" => self.data_path(rest, collection).await,
            "auth" => self.auth_path(rest).await,
            _ => Ok(Resolved::Gap),
        }
    }

    /// `@request.data.<field>[...]`; values of declared fields take the
    /// field's type and relation fields can be traversed.
    async fn data_path(
        &self,
        segments: &[String],
        collection: &Arc<Collection>,
    ) -> Result<Resolved, EvalError> {
        let Some((key, rest)) = segments.split_first() else {
            return Ok(Resolved::Gap);
        };
        let value = self.request.data.get(key).cloned().unwrap_or_default();

        match collection.field_type(key) {
            Some(field_type) if rest.is_empty() => {
                Ok(Resolved::values(Scalar::from_field(&field_type, &value)))
            }
            Some(FieldType::Relation {
                collection: target, ..
            }) => {
                let Some(target) = self.collections.find_collection(&target).await? else {
                    return Ok(Resolved::Gap);
                };
                let ids = relation_ids(&value);
                if ids.is_empty() {
                    return Ok(Resolved::values(Vec::new()));
                }
                let records = self.records.find_records(&target.name, &ids).await?;
                if records.is_empty() {
                    return Ok(Resolved::values(Vec::new()));
                }
                self.record_path(target, records, rest).await
            }
            _ => Ok(Resolved::values(Scalar::from_value(&json_path(&value, rest)))),
        }
    }

    /// `@request.auth.<path>`; guests resolve everything to `null`.
    async fn auth_path(&self, segments: &[String]) -> Result<Resolved, EvalError> {
        let auth = &self.request.auth;
        let Some(first) = segments.first() else {
            return Ok(Resolved::Gap);
        };

        match auth.identity() {
            Identity::Guest => Ok(Resolved::null()),
            Identity::Admin(admin) => {
                if first == "id" && segments.len() == 1 {
                    return Ok(Resolved::values(vec![Scalar::Text(admin.id.clone())]));
                }
                Ok(map_path(auth.claims(), segments))
            }
            Identity::User(record) => {
                if let [field] = segments {
                    if field == "id" || field == "collectionName" {
                        let value = record.field(field).unwrap_or_default();
                        return Ok(Resolved::values(Scalar::from_value(&value)));
                    }
                }
                if let Some(schema) = self
                    .collections
                    .find_collection(&record.collection_name)
                    .await?
                {
                    if schema.field_type(first).is_some() {
                        return self.record_path(schema, vec![record.clone()], segments).await;
                    }
                }
                Ok(map_path(auth.claims(), segments))
            }
        }
    }

    /// `@collection.<name>.<path>` over every record of `<name>`.
    async fn collection_path(&self, segments: &[String]) -> Result<Resolved, EvalError> {
        let [name, path @ ..] = segments else {
            return Ok(Resolved::Gap);
        };
        if path.is_empty() {
            return Ok(Resolved::Gap);
        }
        let Some(schema) = self.collections.find_collection(name).await? else {
            return Ok(Resolved::Gap);
        };
        let records = self.records.find_all(&schema.name).await?;
        if records.is_empty() {
            return Ok(Resolved::Values {
                items: Vec::new(),
                existence: true,
            });
        }

        Ok(match self.record_path(schema, records, path).await? {
            Resolved::Values { items, .. } => Resolved::Values {
                items,
                existence: true,
            },
            Resolved::Gap => Resolved::Gap,
        })
    }
}

/// Reads `segments` out of a parameter map; absent keys are `null`.
fn map_path(map: &BTreeMap<String, Value>, segments: &[String]) -> Resolved {
    let Some((key, rest)) = segments.split_first() else {
        return Resolved::Gap;
    };
    let value = map.get(key).cloned().unwrap_or_default();
    Resolved::values(Scalar::from_value(&json_path(&value, rest)))
}

/// Indexes into nested JSON; a missing key or index yields `null`.
fn json_path(value: &Value, segments: &[String]) -> Value {
    let mut current = value;
    for segment in segments {
        let next = match current {
            Value::Map(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}
