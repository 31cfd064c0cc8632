//! Shared fixtures: an app with a `users` auth collection and an
//! owner-gated `posts` collection.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use rulebase_core::{Collection, CollectionType, FieldDef, FieldType, Record, RuleSet};
use rulebase_server::config::AuthConfig;
use rulebase_server::network::{router, AppState, NetworkConfig, ShutdownController};
use rulebase_server::{App, ServerConfig};
use serde_json::Value;
use tower::ServiceExt;

pub const OWNER_RULE: &str = "author = @request.auth.id";

pub fn app() -> Arc<App> {
    let app = App::new(ServerConfig {
        auth: AuthConfig {
            secret: "integration-secret".to_string(),
            ..AuthConfig::default()
        },
        ..ServerConfig::default()
    });
    app.load_collections(vec![
        Collection::new("users", CollectionType::Auth),
        Collection::new("posts", CollectionType::Base)
            .with_field(FieldDef::new("title", FieldType::Text).required())
            .with_field(FieldDef::new(
                "author",
                FieldType::Relation {
                    collection: "users".to_string(),
                    max_select: None,
                },
            ))
            .with_rules(RuleSet {
                list_rule: Some(OWNER_RULE.to_string()),
                view_rule: Some(OWNER_RULE.to_string()),
                create_rule: Some(
                    "@request.auth.id != '' && @request.data.author = @request.auth.id"
                        .to_string(),
                ),
                update_rule: Some(OWNER_RULE.to_string()),
                delete_rule: None,
            }),
    ])
    .unwrap();
    app
}

/// Inserts a user and returns its bearer token.
pub fn user(app: &App, id: &str) -> String {
    let record = Record::new("users", id).with_field("verified", true);
    app.records.insert(record.clone()).unwrap();
    app.record_token(&record).unwrap()
}

pub fn admin(app: &App) -> String {
    let admin = app.admins.create("root@example.com");
    app.admin_token(&admin).unwrap()
}

pub fn state(app: &Arc<App>, config: NetworkConfig) -> AppState {
    AppState {
        app: Arc::clone(app),
        shutdown: Arc::new(ShutdownController::new()),
        config: Arc::new(config),
        start_time: Instant::now(),
    }
}

pub fn routes(app: &Arc<App>) -> Router {
    router(state(app, NetworkConfig::default()))
}

/// Sends one request through a fresh router and returns status plus JSON
/// body (`Null` when empty).
pub async fn send(
    app: &Arc<App>,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = routes(app).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}
