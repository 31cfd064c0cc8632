//! `rulebase-server` entry point.
//!
//! Loads an optional JSON schema file, creates the bootstrap admin and
//! serves until Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rulebase_core::Collection;
use rulebase_server::network::{ConnectionConfig, NetworkConfig, NetworkModule};
use rulebase_server::{App, AuthConfig, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "rulebase-server", version, about = "Rule-gated records over REST and realtime")]
struct Args {
    #[arg(long, env = "RULEBASE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "RULEBASE_PORT", default_value_t = 8090)]
    port: u16,

    /// HMAC secret used to sign and verify auth tokens.
    #[arg(long, env = "RULEBASE_JWT_SECRET")]
    jwt_secret: String,

    /// Token lifetime in seconds.
    #[arg(long, env = "RULEBASE_TOKEN_TTL", default_value_t = 1_209_600)]
    token_ttl: u64,

    /// JSON array of collection definitions loaded at startup.
    #[arg(long, env = "RULEBASE_SCHEMA")]
    schema: Option<PathBuf>,

    /// Email of the admin created when none exists.
    #[arg(long, env = "RULEBASE_ADMIN_EMAIL")]
    admin_email: Option<String>,

    /// Allowed CORS origin; repeat for several. Defaults to any.
    #[arg(long = "cors-origin", env = "RULEBASE_CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// REST request timeout in seconds.
    #[arg(long, env = "RULEBASE_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,

    /// Outbound queue length per realtime client before it is dropped.
    #[arg(long, env = "RULEBASE_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Most topics one realtime client may subscribe to.
    #[arg(long, env = "RULEBASE_MAX_TOPICS", default_value_t = 500)]
    max_topics: usize,

    #[arg(long, env = "RULEBASE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = ServerConfig {
        network: network_config(&args),
        auth: AuthConfig {
            secret: args.jwt_secret.clone(),
            token_ttl: Duration::from_secs(args.token_ttl),
        },
        ..ServerConfig::default()
    };
    let network = config.network.clone();
    let app = App::new(config);

    if let Some(path) = &args.schema {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema {}", path.display()))?;
        let collections: Vec<Collection> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing schema {}", path.display()))?;
        let count = collections.len();
        app.load_collections(collections)?;
        info!(collections = count, "schema loaded");
    }

    if let Some(email) = &args.admin_email {
        match app.bootstrap_admin(email) {
            Some(admin) => {
                let token = app.admin_token(&admin)?;
                info!(admin = %admin.id, "bootstrap admin token: {token}");
            }
            None => warn!("admins already exist, skipping bootstrap"),
        }
    }

    let mut module = NetworkModule::new(network, app);
    let port = module.start().await?;
    info!(port, "rulebase server listening");

    module.serve(shutdown_signal()).await?;
    info!("rulebase server stopped");
    Ok(())
}

fn network_config(args: &Args) -> NetworkConfig {
    let defaults = NetworkConfig::default();
    NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        connection: ConnectionConfig {
            outbound_channel_capacity: args.outbound_capacity.max(1),
            max_topics: args.max_topics,
            ..ConnectionConfig::default()
        },
        cors_origins: if args.cors_origins.is_empty() {
            defaults.cors_origins
        } else {
            args.cors_origins.clone()
        },
        request_timeout: Duration::from_secs(args.request_timeout),
        drain_timeout: defaults.drain_timeout,
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rulebase_server=info,rulebase_core=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
