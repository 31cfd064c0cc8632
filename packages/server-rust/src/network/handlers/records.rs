//! Record CRUD endpoints under `/api/collections/{collection}/records`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::{Extension, Json};
use rulebase_core::{AuthContext, Record, Value};
use serde::Serialize;

use super::{request_context, AppState};
use crate::error::ApiError;

type Body = Result<Json<BTreeMap<String, Value>>, JsonRejection>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub total_items: usize,
    pub items: Vec<Record>,
}

fn body(body: Body) -> Result<BTreeMap<String, Value>, ApiError> {
    body.map(|Json(data)| data)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

/// `GET` list; `?filter=` narrows the rule-visible set.
pub async fn list_records_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Extension(auth): Extension<Arc<AuthContext>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = query.get("filter").cloned();
    let request = request_context(&method, &headers, query, BTreeMap::new(), auth);
    let items = state
        .app
        .record_service
        .list(&request, &collection, filter.as_deref())
        .await?;
    Ok(Json(ListResponse {
        total_items: items.len(),
        items,
    }))
}

pub async fn view_record_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Extension(auth): Extension<Arc<AuthContext>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<Record>, ApiError> {
    let request = request_context(&method, &headers, query, BTreeMap::new(), auth);
    let record = state
        .app
        .record_service
        .view(&request, &collection, &id)
        .await?;
    Ok(Json(record))
}

pub async fn create_record_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Extension(auth): Extension<Arc<AuthContext>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    data: Body,
) -> Result<Json<Record>, ApiError> {
    let request = request_context(&method, &headers, query, body(data)?, auth);
    let record = state
        .app
        .record_service
        .create(&request, &collection)
        .await?;
    Ok(Json(record))
}

pub async fn update_record_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Extension(auth): Extension<Arc<AuthContext>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    data: Body,
) -> Result<Json<Record>, ApiError> {
    let request = request_context(&method, &headers, query, body(data)?, auth);
    let record = state
        .app
        .record_service
        .update(&request, &collection, &id)
        .await?;
    Ok(Json(record))
}

pub async fn delete_record_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Extension(auth): Extension<Arc<AuthContext>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let request = request_context(&method, &headers, query, BTreeMap::new(), auth);
    state
        .app
        .record_service
        .delete(&request, &collection, &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
