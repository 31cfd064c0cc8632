//! HTTP and realtime transport: configuration, middleware, handlers and
//! the server lifecycle with graceful shutdown.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::AppState;
pub use module::{router, NetworkModule};
pub use shutdown::*;
