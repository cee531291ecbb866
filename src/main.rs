use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use relay_core::protocol::ProtocolClient;
use relay_gateway::{GatewayConfig, GatewayServer, Notifier, Supervisor, SupervisorConfig};
use relay_store::{CredentialRepo, Database};
use relay_worker::worker::WorkerConfig;

mod loopback;

/// Session gateway for long-lived messaging connections.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// HTTP port (overrides RELAY_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Worker pool size (overrides RELAY_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Credential database path (overrides RELAY_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Webhook URL for session events (overrides RELAY_WEBHOOK_URL)
    #[arg(long)]
    webhook_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if cli.webhook_url.is_some() {
        config.webhook_url = cli.webhook_url;
    }

    tracing::info!(workers = config.workers, "starting relay gateway");

    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).expect("failed to create database directory");
        }
    }
    let db = Database::open(&config.db_path).expect("failed to open database");
    tracing::info!(path = %config.db_path.display(), "database opened");

    let creds = CredentialRepo::new(db);
    let notifier = Notifier::new(config.webhook_url.clone());
    let client: Arc<dyn ProtocolClient> = Arc::new(loopback::LoopbackClient::new());

    let supervisor = Supervisor::start(
        client,
        creds,
        notifier,
        SupervisorConfig {
            workers: config.workers,
            ipc_timeout: config.ipc_timeout,
            worker: WorkerConfig::default(),
        },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = GatewayServer::bind(addr, supervisor.clone())
        .await
        .expect("failed to bind");
    tracing::info!(addr = %server.local_addr(), "relay gateway ready");

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    supervisor.shutdown();
    tracing::info!("shut down");
}
