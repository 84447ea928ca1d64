// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven runtime settings for Fieldplane binaries.
//!
//! All knobs have working defaults so a bare process comes up in a dev
//! posture; deployments pin identity and routing through the environment.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the feed reader reaches the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Probe local first, fall back to ssh.
    Auto,
    /// Direct filesystem.
    Local,
    /// Plain remote over ssh.
    Ssh,
    /// Remote through the constrained executor.
    SshGuard,
}

impl ReadMode {
    fn parse(raw: &str) -> Result<Self, SettingsError> {
        match raw {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "ssh" => Ok(Self::Ssh),
            "ssh_guard" => Ok(Self::SshGuard),
            other => Err(SettingsError::BadValue {
                var: "READ_MODE",
                value: other.to_string(),
            }),
        }
    }
}

/// Settings shared across the plane's binaries, read once at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the vault ingest surface.
    pub vault_ingest_url: String,
    /// Auxiliary host for ssh read modes.
    pub aux_host: Option<String>,
    /// Host that runs the store for remote readers.
    pub logger_host: Option<String>,
    /// Stable node identifier of this process.
    pub node_id: String,
    /// Hardware identifier of this host.
    pub device_id: String,
    /// Role this node plays (`tier1`, `scout`, ...).
    pub role: String,
    /// Default per-run child process deadline.
    pub default_timeout: Duration,
    /// Health/readiness refresh interval.
    pub health_interval: Duration,
    /// Capability descriptor path.
    pub capabilities_path: PathBuf,
    /// Claim database path.
    pub claim_db_path: PathBuf,
    /// BLE registry SQLite path.
    pub ble_registry_db: PathBuf,
    /// Feed reader access mode.
    pub read_mode: ReadMode,
}

/// Errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A variable was present but unparseable.
    #[error("bad value for {var}: {value:?}")]
    BadValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_ms(name: &'static str, default_ms: u64) -> Result<Duration, SettingsError> {
    match env(name) {
        None => Ok(Duration::from_millis(default_ms)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| SettingsError::BadValue { var: name, value: raw }),
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        let read_mode = match env("READ_MODE") {
            None => ReadMode::Auto,
            Some(raw) => ReadMode::parse(&raw)?,
        };

        Ok(Self {
            vault_ingest_url: env("VAULT_INGEST_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            aux_host: env("AUX_HOST"),
            logger_host: env("LOGGER_HOST"),
            node_id: env("NODE_ID").unwrap_or_else(|| "node-unnamed".to_string()),
            device_id: env("DEVICE_ID").unwrap_or_else(|| "device-unknown".to_string()),
            role: env("ROLE").unwrap_or_else(|| "scout".to_string()),
            default_timeout: env_ms("DEFAULT_TIMEOUT_MS", 30_000)?,
            health_interval: env_ms("HEALTH_INTERVAL_MS", 15_000)?,
            capabilities_path: env("CAPABILITIES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("capabilities.json")),
            claim_db_path: env("CLAIM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("claim.json")),
            ble_registry_db: env("BLE_REGISTRY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ble_registry.sqlite")),
            read_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_mode_parse() {
        assert_eq!(ReadMode::parse("auto").unwrap(), ReadMode::Auto);
        assert_eq!(ReadMode::parse("local").unwrap(), ReadMode::Local);
        assert_eq!(ReadMode::parse("ssh").unwrap(), ReadMode::Ssh);
        assert_eq!(ReadMode::parse("ssh_guard").unwrap(), ReadMode::SshGuard);
        assert!(ReadMode::parse("carrier-pigeon").is_err());
    }

    // Environment-variable reads are not exercised here: test processes
    // share one environment and the defaults path covers the parse logic.
    #[test]
    fn defaults_come_up() {
        let s = Settings::from_env().unwrap();
        assert!(!s.node_id.is_empty());
        assert!(s.default_timeout.as_millis() > 0);
    }
}
