//! HTTP error type and its JSON envelope.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rulebase_core::{EvalError, RuleError, SchemaError, SyntaxError};
use serde::Serialize;
use serde_json::json;

use crate::storage::StorageError;

/// Errors returned by the REST handlers.
///
/// Rendered as `{ "code": <status>, "message": "...", "data": {...} }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        message: String,
        /// Field name -> failure description.
        data: BTreeMap<String, String>,
    },
    #[error("The request requires valid authorization.")]
    Unauthorized,
    #[error("You are not allowed to perform this request.")]
    Forbidden,
    #[error("The requested resource wasn't found.")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
    data: serde_json::Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, data) = match self {
            Self::BadRequest { message, data } => {
                let data = data
                    .into_iter()
                    .map(|(field, reason)| (field, json!({ "message": reason })))
                    .collect::<serde_json::Map<_, _>>();
                (message, serde_json::Value::Object(data))
            }
            Self::Internal(err) => {
                tracing::error!(error = ?err, "request failed");
                (
                    "Something went wrong while processing your request.".to_string(),
                    json!({}),
                )
            }
            other => (other.to_string(), json!({})),
        };

        let body = ErrorBody {
            code: status.as_u16(),
            message,
            data,
        };
        (status, Json(body)).into_response()
    }
}

impl From<EvalError> for ApiError {
    fn from(err: EvalError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<SchemaError> for ApiError {
    fn from(err: SchemaError) -> Self {
        let field = match &err {
            SchemaError::InvalidName(_) => "name".to_string(),
            SchemaError::InvalidFieldName(name)
            | SchemaError::DuplicateField(name)
            | SchemaError::ReservedField(name) => format!("fields.{name}"),
            SchemaError::UnknownRelationTarget { field, .. } => format!("fields.{field}"),
            SchemaError::Rule(rule) => rule.rule.as_str().to_string(),
        };
        let mut data = BTreeMap::new();
        data.insert(field, err.to_string());
        Self::BadRequest {
            message: "Failed to save the collection.".to_string(),
            data,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::NotFound,
            StorageError::Duplicate { .. } => {
                let mut data = BTreeMap::new();
                data.insert("id".to_string(), err.to_string());
                Self::BadRequest {
                    message: "Failed to create record.".to_string(),
                    data,
                }
            }
        }
    }
}

/// A malformed `?filter=` parameter.
impl From<SyntaxError> for ApiError {
    fn from(err: SyntaxError) -> Self {
        let mut data = BTreeMap::new();
        data.insert("filter".to_string(), err.to_string());
        Self::BadRequest {
            message: "Invalid filter parameter.".to_string(),
            data,
        }
    }
}
