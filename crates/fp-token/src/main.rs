#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_token::{AppState, build_app};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldplane-token", version, about = "Fieldplane room token issuer")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8082")]
    bind: String,

    /// Messaging-plane URL probed by /health.
    #[arg(long)]
    gateway_url: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp_token=debug")
    } else {
        EnvFilter::new("fp_token=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = Arc::new(AppState::new(args.gateway_url.clone()));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "fieldplane-token listening");

    axum::serve(listener, app).await.context("serve")
}
