//! Admin-only schema endpoints under `/api/collections`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use rulebase_core::{AuthContext, Collection};

use super::AppState;
use crate::error::ApiError;

pub async fn list_collections_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<Arc<AuthContext>>,
) -> Result<Json<Vec<Collection>>, ApiError> {
    let collections = state.app.collection_service.list(&auth)?;
    Ok(Json(collections.iter().map(|c| Collection::clone(c)).collect()))
}

pub async fn view_collection_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(auth): Extension<Arc<AuthContext>>,
) -> Result<Json<Collection>, ApiError> {
    let collection = state.app.collection_service.view(&auth, &name)?;
    Ok(Json(Collection::clone(&collection)))
}

/// Creates or replaces a definition. Malformed rules are rejected with the
/// offending rule and position in `data`.
pub async fn save_collection_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<Arc<AuthContext>>,
    body: Result<Json<Collection>, JsonRejection>,
) -> Result<Json<Collection>, ApiError> {
    let Json(collection) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let saved = state.app.collection_service.save(&auth, collection)?;
    Ok(Json(Collection::clone(&saved)))
}

pub async fn delete_collection_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(auth): Extension<Arc<AuthContext>>,
) -> Result<StatusCode, ApiError> {
    state.app.collection_service.delete(&auth, &name)?;
    Ok(StatusCode::NO_CONTENT)
}
