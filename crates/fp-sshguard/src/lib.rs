// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Fail-closed constrained executor.
//!
//! One JSON request per invocation on stdin, one JSON response on
//! stdout.  The allowlist is reloaded on every call; a missing or
//! invalid file refuses everything.  The intent is written to the vault
//! before execution — no vault, no run.

use fp_core::{Envelope, topics::events};
use fp_policy::{CommandAllowlist, CommandSpec, DenyCode};
use fp_vault::client::VaultClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Guard process exit codes.
pub mod exit_codes {
    /// Executed (the command's own exit code rides in the response).
    pub const OK: i32 = 0;
    /// Unparseable request.
    pub const BAD_REQUEST: i32 = 2;
    /// Policy refused.
    pub const POLICY_DENIED: i32 = 3;
    /// Vault unreachable where vault-first is required.
    pub const VAULT_DOWN: i32 = 4;
}

/// What arrives on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardRequest {
    /// Absolute binary path.
    pub cmd: PathBuf,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-run deadline override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// What goes back on stdout.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GuardResponse {
    /// Whether the command ran and exited zero.
    pub ok: bool,
    /// Typed denial code when policy refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_code: Option<String>,
    /// What tripped the denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_detail: Option<String>,
    /// Command exit code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether the deadline killed it.
    #[serde(default)]
    pub timed_out: bool,
    /// Captured stdout (truncated at the exec layer).
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: String,
    /// Digest of the full stdout stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_sha256: Option<String>,
    /// Digest of the full stderr stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_sha256: Option<String>,
    /// Guard-level error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything one invocation needs.
pub struct Guard {
    /// Allowlist path, re-read per call.
    pub allowlist_path: PathBuf,
    /// Vault writer.
    pub vault: VaultClient,
    /// Identity stamped on audit events.
    pub node_id: String,
    /// Deadline when the request does not name one.
    pub default_timeout: Duration,
}

impl Guard {
    /// Process one raw request; returns the response and the exit code.
    pub async fn run(&self, raw: &str) -> (GuardResponse, i32) {
        let request: GuardRequest = match serde_json::from_str(raw.trim()) {
            Ok(req) => req,
            Err(err) => {
                return (
                    GuardResponse {
                        error: Some(format!("bad request: {err}")),
                        ..Default::default()
                    },
                    exit_codes::BAD_REQUEST,
                );
            }
        };

        // Fresh allowlist every call; any load failure refuses.
        let allowlist = match CommandAllowlist::load(&self.allowlist_path) {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "allowlist unavailable; refusing");
                return self
                    .deny(
                        &request,
                        DenyCode::NotAllowed,
                        format!("allowlist unavailable: {err}"),
                    )
                    .await;
            }
        };

        let spec = CommandSpec {
            cmd: request.cmd.clone(),
            args: request.args.clone(),
            cwd: request.cwd.clone().unwrap_or_else(|| PathBuf::from("/")),
        };
        if let Err(denial) = fp_policy::check(&allowlist, &spec) {
            return self.deny(&request, denial.code, denial.detail).await;
        }

        // Vault-first, no exceptions.
        let intent = Envelope::new(
            events::SSH_INTENT,
            self.node_id.clone(),
            json!({"cmd": spec.cmd, "args": spec.args, "cwd": spec.cwd}),
        );
        if self.vault.ingest_required(&intent).await.is_err() {
            return (
                GuardResponse {
                    denied_code: Some(DenyCode::VaultDownFailClosed.as_str().to_string()),
                    denied_detail: Some("vault unreachable".to_string()),
                    ..Default::default()
                },
                exit_codes::VAULT_DOWN,
            );
        }

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        match fp_exec::run(&spec, timeout).await {
            Ok(outcome) => {
                let result = Envelope::new(
                    events::SSH_RESULT,
                    self.node_id.clone(),
                    json!({
                        "cmd": spec.cmd,
                        "exit_code": outcome.exit_code,
                        "timed_out": outcome.timed_out,
                        "duration_ms": outcome.duration_ms,
                        "stdout_sha256": outcome.stdout_sha256,
                        "stderr_sha256": outcome.stderr_sha256,
                    }),
                );
                self.vault.ingest_best_effort(&result).await;
                (
                    GuardResponse {
                        ok: outcome.ok(),
                        exit_code: outcome.exit_code,
                        timed_out: outcome.timed_out,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        stdout_sha256: Some(outcome.stdout_sha256),
                        stderr_sha256: Some(outcome.stderr_sha256),
                        ..Default::default()
                    },
                    exit_codes::OK,
                )
            }
            Err(err) => {
                let result = Envelope::new(
                    events::SSH_RESULT,
                    self.node_id.clone(),
                    json!({"cmd": spec.cmd, "ok": false, "error": err.to_string()}),
                );
                self.vault.ingest_best_effort(&result).await;
                (
                    GuardResponse {
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                    exit_codes::OK,
                )
            }
        }
    }

    async fn deny(
        &self,
        request: &GuardRequest,
        code: DenyCode,
        detail: String,
    ) -> (GuardResponse, i32) {
        let denied = Envelope::new(
            events::SSH_DENIED,
            self.node_id.clone(),
            json!({
                "cmd": request.cmd,
                "args": request.args,
                "denied_code": code.as_str(),
                "denied_detail": detail,
            }),
        );
        self.vault.ingest_best_effort(&denied).await;
        (
            GuardResponse {
                denied_code: Some(code.as_str().to_string()),
                denied_detail: Some(detail),
                ..Default::default()
            },
            exit_codes::POLICY_DENIED,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fp_store::EventStore;
    use std::sync::Arc;

    struct Harness {
        guard: Guard,
        store: Arc<EventStore>,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path().join("vault")));
        let vault_state = Arc::new(fp_vault::AppState::new(store.clone(), None, "vault-1".into()));
        let app = fp_vault::build_app(vault_state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let allowlist_path = dir.path().join("allowlist.json");
        let allowlist = json!({
            "commands": {
                "/bin/echo": {
                    "max_args": 3,
                    "cwd_roots": [dir.path().display().to_string()]
                },
                "/bin/sleep": {
                    "max_args": 1,
                    "cwd_roots": [dir.path().display().to_string()]
                }
            }
        });
        std::fs::write(&allowlist_path, serde_json::to_vec_pretty(&allowlist).unwrap()).unwrap();

        Harness {
            guard: Guard {
                allowlist_path,
                vault: VaultClient::new(format!("http://{addr}")),
                node_id: "bench-host".into(),
                default_timeout: Duration::from_secs(5),
            },
            store,
            dir,
        }
    }

    fn request(dir: &tempfile::TempDir, cmd: &str, args: &[&str]) -> String {
        serde_json::to_string(&json!({
            "cmd": cmd,
            "args": args,
            "cwd": dir.path().display().to_string(),
        }))
        .unwrap()
    }

    fn kinds(store: &EventStore) -> Vec<String> {
        store
            .tail(100)
            .unwrap()
            .events
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    #[tokio::test]
    async fn allowed_command_runs_with_audit_pair() {
        let h = harness().await;
        let raw = request(&h.dir, "/bin/echo", &["guarded"]);
        let (resp, code) = h.guard.run(&raw).await;

        assert_eq!(code, exit_codes::OK);
        assert!(resp.ok);
        assert_eq!(resp.exit_code, Some(0));
        assert_eq!(resp.stdout, "guarded\n");
        assert!(resp.stdout_sha256.is_some());

        let all = kinds(&h.store);
        assert!(all.contains(&events::SSH_INTENT.to_string()));
        assert!(all.contains(&events::SSH_RESULT.to_string()));
    }

    #[tokio::test]
    async fn denied_command_exits_three() {
        let h = harness().await;
        let raw = request(&h.dir, "/bin/bash", &["-c", "true"]);
        let (resp, code) = h.guard.run(&raw).await;

        assert_eq!(code, exit_codes::POLICY_DENIED);
        assert!(!resp.ok);
        assert_eq!(resp.denied_code.as_deref(), Some("NOT_ALLOWED"));

        let all = kinds(&h.store);
        assert!(all.contains(&events::SSH_DENIED.to_string()));
        assert!(!all.contains(&events::SSH_INTENT.to_string()));
    }

    #[tokio::test]
    async fn bad_request_exits_two() {
        let h = harness().await;
        let (resp, code) = h.guard.run("this is not json").await;
        assert_eq!(code, exit_codes::BAD_REQUEST);
        assert!(resp.error.is_some());
        assert!(kinds(&h.store).is_empty());
    }

    #[tokio::test]
    async fn missing_allowlist_fails_closed() {
        let mut h = harness().await;
        h.guard.allowlist_path = h.dir.path().join("absent.json");
        let raw = request(&h.dir, "/bin/echo", &["hi"]);
        let (resp, code) = h.guard.run(&raw).await;

        assert_eq!(code, exit_codes::POLICY_DENIED);
        assert_eq!(resp.denied_code.as_deref(), Some("NOT_ALLOWED"));
    }

    #[tokio::test]
    async fn vault_down_refuses_to_run() {
        let h = harness().await;
        let guard = Guard {
            allowlist_path: h.guard.allowlist_path.clone(),
            vault: VaultClient::new("http://127.0.0.1:9"),
            node_id: "bench-host".into(),
            default_timeout: Duration::from_secs(5),
        };
        let marker = h.dir.path().join("must-not-exist");
        let raw = serde_json::to_string(&json!({
            "cmd": "/bin/echo",
            "args": ["boom"],
            "cwd": h.dir.path().display().to_string(),
        }))
        .unwrap();
        let (resp, code) = guard.run(&raw).await;

        assert_eq!(code, exit_codes::VAULT_DOWN);
        assert_eq!(
            resp.denied_code.as_deref(),
            Some("VAULT_DOWN_FAIL_CLOSED")
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let h = harness().await;
        let raw = serde_json::to_string(&json!({
            "cmd": "/bin/sleep",
            "args": ["30"],
            "cwd": h.dir.path().display().to_string(),
            "timeout_ms": 200,
        }))
        .unwrap();
        let (resp, code) = h.guard.run(&raw).await;
        assert_eq!(code, exit_codes::OK);
        assert!(resp.timed_out);
        assert!(!resp.ok);
    }
}
