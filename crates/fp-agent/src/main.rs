#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_agent::{Agent, AgentIdentity, Modes, Platform};
use fp_bus::LocalBus;
use fp_capability::CapabilityCell;
use fp_policy::CommandAllowlist;
use fp_ratelimit::DispatchGate;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldplane-agent", version, about = "Fieldplane execution agent")]
struct Args {
    /// Command allowlist path.
    #[arg(long, default_value = "allowlist.json")]
    allowlist: PathBuf,

    /// Working directory for commands.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp=debug,fp_agent=debug")
    } else {
        EnvFilter::new("fp=info,fp_agent=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = fp_config::Settings::from_env()?;

    let allowlist = match CommandAllowlist::load(&args.allowlist) {
        Ok(list) => list,
        Err(err) => {
            // Fail-closed: with no allowlist no command ever runs, but
            // the non-shell actions still work.
            warn!(path = %args.allowlist.display(), error = %err, "allowlist unavailable; commands disabled");
            CommandAllowlist::default()
        }
    };

    let identity = AgentIdentity {
        node_id: settings.node_id.clone(),
        device_id: settings.device_id.clone(),
        role: settings.role.clone(),
        platform: Platform::detect(),
    };
    info!(node_id = %identity.node_id, role = %identity.role, "agent starting");

    let agent = Arc::new(Agent {
        caps: CapabilityCell::init(&settings.capabilities_path, &settings.node_id),
        caps_path: settings.capabilities_path.clone(),
        allowlist,
        gate: DispatchGate::new(),
        vault: fp_vault::client::VaultClient::new(settings.vault_ingest_url.clone()),
        modes: Mutex::new(Modes::default()),
        claim_db_path: settings.claim_db_path.clone(),
        work_dir: args.work_dir.unwrap_or_else(std::env::temp_dir),
        default_timeout: settings.default_timeout,
        identity,
    });

    fp_agent::spawn_reload_on_sighup(agent.clone());

    // The in-process bus; a transport adapter replaces this in
    // deployments with a real messaging plane.
    let bus = Arc::new(LocalBus::default());
    fp_agent::run(agent, bus).await.context("agent loop")
}
