//! `Rulebase` Server: REST and realtime front end for rule-gated records.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod network;
pub mod realtime;
pub mod rules;
pub mod service;
pub mod storage;

pub use app::App;
pub use config::{AuthConfig, RealtimeConfig, ServerConfig};
pub use error::ApiError;
