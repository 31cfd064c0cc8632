//! Per-request auth context loading.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::AuthPropagator;

/// Resolves the `Authorization` header and stores the resulting
/// `Arc<AuthContext>` in the request extensions.
///
/// Runs for every request. Guests pass through; handlers that need an
/// identity reject them themselves.
pub async fn load_auth_context(
    State(propagator): State<Arc<AuthPropagator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let auth = propagator.resolve(header.as_deref()).await;
    request.extensions_mut().insert(Arc::new(auth));
    next.run(request).await
}
