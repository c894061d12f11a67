//! Stork server
//!
//! Monitors Kea and BIND 9 through Stork agents and serves the REST API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use stork_core::config::{default_database_path, load_config};
use stork_server::agentcomm::{AgentClient, HttpTransport};
use stork_server::certs::setup_server_ca;
use stork_server::configmgr::ConfigManager;
use stork_server::dns::ZoneManager;
use stork_server::puller::server_pullers;
use stork_server::rest::{AppState, build_router};
use stork_server::review::ConfigReviewer;
use stork_server::storage::{DEFAULT_ADMIN_LOGIN, ServerDatabase};

/// Connect timeout towards agents; the whole call is bounded separately.
const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "stork-server")]
#[command(version, about = "Stork server - Kea and BIND 9 management")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "STORK_CONFIG")]
    config: Option<PathBuf>,

    /// REST listen address (overrides the configuration file)
    #[arg(long)]
    rest_addr: Option<SocketAddr>,

    /// Database file path (overrides the configuration file)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "STORK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.rest_addr {
        config.server.rest_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.database.path = Some(path);
    }

    let log_filter = format!("stork_server={}", config.server.log_level);
    stork_core::tracing_init::init_tracing(&log_filter, args.log_json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.rest_addr,
        "Starting stork-server"
    );

    let db_path = config
        .database
        .path
        .clone()
        .or_else(default_database_path)
        .context("Cannot determine the database path; set --db-path")?;
    let db = ServerDatabase::open(&db_path).await?;
    if db.ensure_default_admin().await? {
        info!(login = DEFAULT_ADMIN_LOGIN, "Created default administrator");
    }
    let ca = setup_server_ca(&db, &config.pki.organization).await?;

    let transport = Arc::new(HttpTransport::new(config.agents.use_tls, AGENT_CONNECT_TIMEOUT)?);
    let agents = Arc::new(AgentClient::new(
        transport,
        Duration::from_secs(config.agents.request_timeout_secs),
    ));

    let shutdown = CancellationToken::new();
    let pullers = Arc::new(server_pullers(&db, &agents, &config.pullers, shutdown.clone()));
    pullers.start().await;

    let state = AppState {
        db: db.clone(),
        agents: Arc::clone(&agents),
        config_manager: Arc::new(ConfigManager::new(
            db.clone(),
            Arc::clone(&agents),
            Duration::from_secs(config.transactions.ttl_secs),
        )),
        zone_manager: Arc::new(ZoneManager::new(
            db.clone(),
            Arc::clone(&agents),
            shutdown.clone(),
        )),
        reviewer: ConfigReviewer::new(db.clone()),
        pullers: Arc::clone(&pullers),
        ca: Arc::new(ca),
        zone_fetch: config.zones.clone(),
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.server.rest_addr).await?;
    info!(addr = %config.server.rest_addr, "REST API ready");
    let signal = shutdown.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                () = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    pullers.shutdown().await;
    info!("Stork server stopped");
    Ok(())
}
