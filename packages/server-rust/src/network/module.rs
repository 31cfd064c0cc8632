//! HTTP/`WebSocket` server lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener and
//! `serve()` accepts connections until the shutdown future resolves. The
//! split lets the binary print the bound port before serving.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    create_record_handler, delete_collection_handler, delete_record_handler, health_handler,
    list_collections_handler, list_records_handler, liveness_handler, readiness_handler,
    realtime_handler, save_collection_handler, update_record_handler, view_collection_handler,
    view_record_handler, AppState,
};
use super::middleware::{not_found, track_in_flight, with_http_layers};
use super::shutdown::ShutdownController;
use crate::app::App;
use crate::auth::load_auth_context;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    app: Arc<App>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, app: Arc<App>) -> Self {
        Self {
            config,
            listener: None,
            app,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router:
    ///
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET|POST /api/collections`, `GET|DELETE /api/collections/{collection}`
    /// - `GET|POST /api/collections/{collection}/records`
    /// - `GET|PATCH|DELETE /api/collections/{collection}/records/{id}`
    /// - `GET /api/realtime` (`WebSocket`)
    ///
    /// Trailing slashes are trimmed before matching and unmatched paths
    /// get the JSON 404 envelope.
    pub fn build_router(&self) -> Router {
        router(AppState {
            app: Arc::clone(&self.app),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        })
    }

    /// Binds the listener and returns the bound port, which differs from
    /// the configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves. Realtime clients are sent a close
    /// frame as soon as the signal fires; HTTP requests then get up to
    /// `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };

        self.shutdown.set_ready();
        info!("serving HTTP and realtime connections");

        let app = Arc::clone(&self.app);
        let controller = Arc::clone(&self.shutdown);
        let signal = async move {
            shutdown.await;
            controller.trigger_shutdown();
            close_realtime(&app);
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!("drain timeout expired with requests still in flight");
        }
        Ok(())
    }
}

/// Builds the full router for `state`.
///
/// Routes registered through the `before_serve` hook are added before the
/// middleware, so they share it.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/collections",
            get(list_collections_handler).post(save_collection_handler),
        )
        .route(
            "/api/collections/{collection}",
            get(view_collection_handler).delete(delete_collection_handler),
        )
        .route(
            "/api/collections/{collection}/records",
            get(list_records_handler).post(create_record_handler),
        )
        .route(
            "/api/collections/{collection}/records/{id}",
            get(view_record_handler)
                .patch(update_record_handler)
                .delete(delete_record_handler),
        )
        .route("/api/realtime", get(realtime_handler))
        .route_layer(from_fn_with_state(
            Arc::clone(&state.app.auth),
            load_auth_context,
        ));

    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .merge(api);
    let routes = state
        .app
        .hooks
        .before_serve
        .apply(routes)
        .fallback(not_found)
        .layer(from_fn_with_state(
            Arc::clone(&state.shutdown),
            track_in_flight,
        ));

    let config = Arc::clone(&state.config);
    let inner = with_http_layers(routes, &config).with_state(state);

    // Path rewriting has to happen before the inner router matches.
    Router::new().fallback_service(NormalizePathLayer::trim_trailing_slash().layer(inner))
}

/// Sends a close frame to every realtime client and stops the dispatch
/// lanes.
fn close_realtime(app: &App) {
    let closed = app.shutdown();
    if closed > 0 {
        info!(connections = closed, "realtime connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn module() -> NetworkModule {
        NetworkModule::new(
            NetworkConfig::default(),
            App::new(ServerConfig::default()),
        )
    }

    #[test]
    fn new_creates_module_without_binding() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module();
        let s1 = module.shutdown_controller();
        let s2 = module.shutdown_controller();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            App::new(ServerConfig::default()),
        );
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }
}
