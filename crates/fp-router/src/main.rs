#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_bus::LocalBus;
use fp_ratelimit::DispatchGate;
use fp_router::{AppState, build_app};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldplane-router", version, about = "Fieldplane action router")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8081")]
    bind: String,

    /// Vault ingest base URL; defaults to VAULT_INGEST_URL.
    #[arg(long)]
    vault_url: Option<String>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp=debug,fp_router=debug")
    } else {
        EnvFilter::new("fp=info,fp_router=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = fp_config::Settings::from_env()?;
    let vault_url = args.vault_url.unwrap_or(settings.vault_ingest_url.clone());

    let gate = Arc::new(DispatchGate::new());
    fp_ratelimit::spawn_sweeper(gate.clone());

    let state = Arc::new(AppState {
        node_id: settings.node_id.clone(),
        gate,
        vault: fp_vault::client::VaultClient::new(vault_url),
        // The in-process bus; a transport adapter replaces this in
        // deployments with a real messaging plane.
        bus: Arc::new(LocalBus::default()),
        started: Instant::now(),
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "fieldplane-router listening");

    axum::serve(listener, app).await.context("serve")
}
