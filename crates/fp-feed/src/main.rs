#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_feed::{AppState, ReadyState, build_app, load_aliases, resolve_source};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldplane-feed", version, about = "Fieldplane event feed reader")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8083")]
    bind: String,

    /// Root folder of the event store (local or remote).
    #[arg(long, default_value = ".fieldplane/vault")]
    store_root: PathBuf,

    /// Official alias map.
    #[arg(long)]
    aliases: Option<PathBuf>,

    /// User overlay alias map; wins on conflicts.
    #[arg(long)]
    user_aliases: Option<PathBuf>,

    /// Guard binary name on the remote for ssh_guard mode.
    #[arg(long, default_value = "fieldplane-sshguard")]
    guard_cmd: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp=debug,fp_feed=debug")
    } else {
        EnvFilter::new("fp=info,fp_feed=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = fp_config::Settings::from_env()?;
    let remote_host = settings
        .logger_host
        .as_deref()
        .or(settings.aux_host.as_deref());

    let source = resolve_source(
        settings.read_mode,
        &args.store_root,
        remote_host,
        &args.guard_cmd,
    );
    let state = Arc::new(AppState {
        source,
        ready: RwLock::new(ReadyState::default()),
        aliases: load_aliases(args.aliases.as_deref(), args.user_aliases.as_deref()),
    });

    fp_feed::refresh_ready(&state).await;
    fp_feed::spawn_ready_refresher(state.clone(), settings.health_interval);

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "fieldplane-feed listening");

    axum::serve(listener, app).await.context("serve")
}
