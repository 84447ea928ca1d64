#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_sshguard::Guard;
use fp_vault::client::VaultClient;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fieldplane-sshguard",
    version,
    about = "Fieldplane constrained executor: one JSON request on stdin, one response on stdout"
)]
struct Args {
    /// Command allowlist path, reloaded per invocation.
    #[arg(long, default_value = "allowlist.json")]
    allowlist: PathBuf,

    /// Enable debug logging (stderr).
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fp=debug,fp_sshguard=debug")
    } else {
        EnvFilter::new("fp_sshguard=warn")
    };
    // Logs go to stderr; stdout is the response channel.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = fp_config::Settings::from_env()?;
    let guard = Guard {
        allowlist_path: args.allowlist,
        vault: VaultClient::new(settings.vault_ingest_url.clone()),
        node_id: settings.node_id.clone(),
        default_timeout: settings.default_timeout,
    };

    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("read request from stdin")?;

    let (response, code) = guard.run(&raw).await;
    println!("{}", serde_json::to_string(&response)?);
    std::process::exit(code);
}
