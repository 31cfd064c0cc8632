//! HTTP middleware for the `Rulebase` server.
//!
//! [`with_http_layers`] wraps a router in the transport stack; the
//! remaining functions are the request-level middleware it and the router
//! use.

use std::any::Any;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any as AnyHeader, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use super::shutdown::ShutdownController;
use crate::error::ApiError;

const X_REQUEST_ID: &str = "x-request-id";

/// Headers every response carries unless a handler set its own.
const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-xss-protection", "1; mode=block"),
];

/// Wraps `router` in the transport middleware, outermost first:
///
/// 1. request id: a UUID v4 `X-Request-Id` unless the client sent one
/// 2. HEAD responses, error envelopes included, lose their body
/// 3. tracing spans
/// 4. gzip
/// 5. CORS for the configured origins
/// 6. security headers
/// 7. 408 after `request_timeout`; the handler future, including any rule
///    evaluation in progress, is dropped
/// 8. the request id is echoed on the response
/// 9. a panicking handler becomes the 500 envelope
///
/// Auth context loading needs app state and is applied by the router.
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let request_id = HeaderName::from_static(X_REQUEST_ID);
    let mut router = router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ));
    for (name, value) in SECURITY_HEADERS {
        router = router.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    router
        .layer(cors(&config.cors_origins))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(strip_head_body))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

/// `"*"` allows any origin; otherwise only the listed ones.
fn cors(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(AnyHeader)
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    ApiError::Internal(anyhow::anyhow!("handler panicked: {detail}")).into_response()
}

/// Drops the body of every `HEAD` response while keeping its status and
/// headers.
async fn strip_head_body(request: Request, next: Next) -> Response {
    let head = request.method() == Method::HEAD;
    let response = next.run(request).await;
    if !head {
        return response;
    }
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}

/// Holds an in-flight guard for the duration of each request so shutdown
/// can wait for them.
pub async fn track_in_flight(
    State(shutdown): State<Arc<ShutdownController>>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = shutdown.in_flight_guard();
    next.run(request).await
}

/// JSON 404 for any path no route matches.
pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use axum::http::Request as HttpRequest;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    fn app(shutdown: &Arc<ShutdownController>, config: &NetworkConfig) -> Router {
        let counter = Arc::clone(shutdown);
        let routes = Router::new()
            .route(
                "/count",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move { counter.in_flight_count().to_string() }
                }),
            )
            .route(
                "/framed",
                get(|| async { ([(header::X_FRAME_OPTIONS, "DENY")], "ok") }),
            )
            .route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            )
            .fallback(not_found)
            .layer(from_fn_with_state(Arc::clone(shutdown), track_in_flight));
        with_http_layers(routes, config)
    }

    async fn call(router: Router, method: Method, uri: &str) -> Response {
        router
            .oneshot(
                HttpRequest::builder()
                    .method(method)
                    .uri(uri)
                    .header("origin", "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn requests_are_counted_while_running() {
        let shutdown = Arc::new(ShutdownController::new());
        let response = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/count").await;
        assert_eq!(body(response).await, b"1");
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let shutdown = Arc::new(ShutdownController::new());
        let response = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/count").await;
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn listed_origin_is_allowed() {
        let shutdown = Arc::new(ShutdownController::new());
        let config = NetworkConfig {
            cors_origins: vec!["https://app.example.com".to_string()],
            ..NetworkConfig::default()
        };
        let response = call(app(&shutdown, &config), Method::GET, "/count").await;
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn security_headers_do_not_override_handlers() {
        let shutdown = Arc::new(ShutdownController::new());
        let plain = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/count").await;
        assert_eq!(plain.headers()["x-content-type-options"], "nosniff");
        assert_eq!(plain.headers()["x-frame-options"], "SAMEORIGIN");
        assert_eq!(plain.headers()["x-xss-protection"], "1; mode=block");

        let framed = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/framed").await;
        assert_eq!(framed.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn panic_becomes_error_envelope() {
        let shutdown = Arc::new(ShutdownController::new());
        let response = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/boom").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");

        let json: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(json["code"], 500);
        assert!(!json["message"].as_str().unwrap().contains("exploded"));
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_path_gets_json_404() {
        let shutdown = Arc::new(ShutdownController::new());
        let response = call(app(&shutdown, &NetworkConfig::default()), Method::GET, "/api/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(json["code"], 404);
        assert!(json["data"].is_object());
    }

    #[tokio::test]
    async fn head_errors_have_no_body() {
        let shutdown = Arc::new(ShutdownController::new());
        let missing = call(app(&shutdown, &NetworkConfig::default()), Method::HEAD, "/api/nope").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert!(body(missing).await.is_empty());

        let crashed = call(app(&shutdown, &NetworkConfig::default()), Method::HEAD, "/boom").await;
        assert_eq!(crashed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(crashed).await.is_empty());
    }
}
