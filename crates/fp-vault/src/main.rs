#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_store::EventStore;
use fp_vault::{AppState, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldplane-vault", version, about = "Fieldplane vault ingest service")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Root folder of the event store.
    #[arg(long, default_value = ".fieldplane/vault")]
    store_root: PathBuf,

    /// BLE registry SQLite path; omit to disable derivation.
    #[arg(long)]
    ble_db: Option<PathBuf>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp=debug,fp_vault=debug")
    } else {
        EnvFilter::new("fp=info,fp_vault=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = fp_config::Settings::from_env()?;
    let ble_db = args.ble_db.or(Some(settings.ble_registry_db.clone()));

    std::fs::create_dir_all(&args.store_root)
        .with_context(|| format!("create store root {}", args.store_root.display()))?;

    let store = Arc::new(EventStore::new(&args.store_root));
    let state = Arc::new(AppState::new(store, ble_db.as_ref(), settings.node_id.clone()));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        store = %args.store_root.display(),
        "fieldplane-vault listening"
    );

    axum::serve(listener, app).await.context("serve")
}
