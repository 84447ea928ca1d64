// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Execution agent.
//!
//! One agent per host, identified by `(node_id, device_id, role)`.  It
//! subscribes to the class topics, decides per message whether the scope
//! names this host, walks the guard chain (allowlist → dedupe → rate →
//! capability → mode gates), and only then executes — always writing the
//! intent to the vault before the side effect and the result after.

/// Action → command table and audit naming.
pub mod actions;
/// Host snapshot assembly.
pub mod snapshot;

use actions::{PlanError, event_family, plan_command, resolve_tool};
use fp_bus::MessageBus;
use fp_capability::CapabilityCell;
use fp_core::{ActionClass, Envelope, GodRequest, Scope, topics, topics::events};
use fp_policy::{CommandAllowlist, CommandSpec, DenyCode};
use fp_ratelimit::DispatchGate;
use fp_vault::client::VaultClient;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snapshot::HostSnapshot;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How much stdout/stderr rides along in result events for caller
/// convenience; digests cover the full streams.
const RESULT_OUTPUT_CHARS: usize = 4096;

/// Topics an agent consumes.  `god.button` is the observers' mirror; the
/// class topics are the work queue, so a request arrives here once.
pub const CLASS_TOPICS: &[&str] = &[
    topics::OPS_PANIC,
    topics::OPS_SNAPSHOT,
    topics::OPS_MAINT,
    topics::OPS_SCAN,
    topics::OPS_BUILD,
    topics::OPS_RITUAL,
    topics::OPS_CLAIM,
    topics::OPS_FLASH,
    topics::OPS_HEALTH_REQUEST,
];

/// Host platform, for `mac`/`pi` scope matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// macOS host.
    Mac,
    /// Raspberry Pi (linux) host.
    Pi,
    /// Anything else.
    Other,
}

impl Platform {
    /// Compile-target detection, overridable via config.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::Mac
        } else if cfg!(target_os = "linux") {
            Self::Pi
        } else {
            Self::Other
        }
    }
}

/// Who this agent is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Stable node identifier.
    pub node_id: String,
    /// Hardware identifier.
    pub device_id: String,
    /// Role (`tier1`, `scout`, ...).
    pub role: String,
    /// Platform for scope matching.
    pub platform: Platform,
}

/// Local mode flags toggled by ritual/panic actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modes {
    /// Freeze: only `panic.*` and `ritual.wake.mode` run.
    pub frozen: bool,
    /// Quiet: `scan.*` is blocked.
    pub quiet: bool,
}

/// The agent.
pub struct Agent {
    /// Identity used for scope matching and event `src`.
    pub identity: AgentIdentity,
    /// Capability matrix, swapped on reload.
    pub caps: CapabilityCell,
    /// Where the capability descriptor lives (reload re-reads it).
    pub caps_path: PathBuf,
    /// Command allowlist.
    pub allowlist: CommandAllowlist,
    /// Dedupe + rate windows (mirrors the router's limits).
    pub gate: DispatchGate,
    /// Vault writer.
    pub vault: VaultClient,
    /// Mode flags.
    pub modes: Mutex<Modes>,
    /// Claim database path.
    pub claim_db_path: PathBuf,
    /// Default working directory for commands.
    pub work_dir: PathBuf,
    /// Default child-process deadline.
    pub default_timeout: Duration,
}

/// One step of a flash/deploy sequence, caller-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Absolute binary path.
    pub cmd: PathBuf,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the agent's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl Agent {
    /// Whether a request's scope names this host.
    pub fn should_handle(&self, req: &GodRequest) -> bool {
        match req.scope {
            Scope::All => true,
            Scope::Node => req.target.as_deref() == Some(self.identity.node_id.as_str()),
            Scope::Tier1 => self.identity.role == "tier1",
            Scope::Mac => self.identity.platform == Platform::Mac,
            Scope::Pi => self.identity.platform == Platform::Pi,
        }
    }

    /// Handle one normalized request end to end.
    pub async fn handle(&self, req: GodRequest) {
        if !self.should_handle(&req) {
            debug!(request_id = %req.request_id, scope = %req.scope, "not for us");
            return;
        }

        // 1. Action allowlist.
        if !req.is_allowlisted() {
            self.result_denied(&req, "not_allowlisted", "action not allowlisted")
                .await;
            return;
        }

        // 2. Dedupe.  The router already audits replays; ours is a safety
        // net against at-least-once delivery, so it skips silently.
        let now = fp_core::now_ms();
        if self.gate.check_duplicate(&req.request_id, now) {
            debug!(request_id = %req.request_id, "already handled");
            return;
        }

        // 3. Per-class rate limit.
        let class = gate_class(&req.action);
        if self.gate.check_rate(class, now).is_err() {
            self.result_denied(&req, "rate_limited", &format!("rate limit exceeded for {class}"))
                .await;
            return;
        }

        // Build the command plan early: the tool alias feeds the
        // capability check.
        let plan = match plan_command(&req.action, &req.args, &self.work_dir) {
            Ok(plan) => plan,
            Err(PlanError::MissingArg(name)) => {
                self.result_denied(&req, "bad_request", &format!("missing required arg: {name}"))
                    .await;
                return;
            }
        };

        // 4. Capability matrix.
        let tool = plan.as_ref().map(|p| p.tool);
        if let Err(denial) = self.caps.get().allows(class, req.scope, tool) {
            let reason = denial.reason();
            self.emit(
                events::AGENT_CAPABILITY_DENIED,
                json!({
                    "request_id": req.request_id,
                    "action": req.action,
                    "denied_reason": reason,
                }),
            )
            .await;
            self.result_denied(&req, "capability_denied", &reason).await;
            return;
        }

        // 5. Mode gates.
        {
            let modes = *self.modes.lock().expect("modes poisoned");
            if modes.frozen
                && !req.action.starts_with("panic.")
                && req.action != "ritual.wake.mode"
            {
                self.result_denied(&req, "capability_denied", "agent frozen").await;
                return;
            }
            if modes.quiet && req.action.starts_with("scan.") {
                self.result_denied(&req, "capability_denied", "quiet mode").await;
                return;
            }
        }

        // Execute.
        if let Some(plan) = plan {
            self.exec_command(&req, plan).await;
            return;
        }
        match req.action.as_str() {
            "snapshot.now" | "ritual.heartbeat.burst" | "node.health.request" => {
                self.health_snapshot(&req).await;
            }
            "snapshot.vault.verify" => self.vault_verify(&req).await,
            "ritual.rollcall" => self.rollcall(&req).await,
            "ritual.quiet.mode" | "ritual.wake.mode" | "panic.freeze.agents" => {
                self.toggle_mode(&req).await;
            }
            "node.claim" => self.claim(&req).await,
            "node.flash" | "build.flash.target" | "build.rollback.target"
            | "build.deploy.config" => {
                self.run_steps(&req).await;
            }
            other => {
                warn!(action = %other, "allowlisted action with no handler");
                self.result_denied(&req, "internal", "no handler for action").await;
            }
        }
    }

    // -- Event plumbing -----------------------------------------------------

    async fn emit(&self, kind: &str, data: Value) {
        self.vault
            .ingest_best_effort(&Envelope::new(kind, self.identity.node_id.clone(), data))
            .await;
    }

    /// Vault-first intent.  `false` means the vault is down and the
    /// caller must not execute.
    async fn intent(&self, req: &GodRequest, detail: Value) -> bool {
        let family = event_family(&req.action);
        let data = json!({
            "request_id": req.request_id,
            "action": req.action,
            "detail": detail,
        });
        let env = Envelope::new(
            format!("{family}.intent"),
            self.identity.node_id.clone(),
            data.clone(),
        );
        if let Err(err) = self.vault.ingest_required(&env).await {
            warn!(request_id = %req.request_id, error = %err, "intent write failed; refusing to execute");
            return false;
        }
        // Unified stream for consumers that do not know action semantics.
        self.emit(events::AGENT_EXEC_INTENT, data).await;
        true
    }

    async fn result(&self, req: &GodRequest, mut data: Value) {
        let family = event_family(&req.action);
        if let Some(obj) = data.as_object_mut() {
            obj.insert("request_id".into(), json!(req.request_id));
            obj.insert("action".into(), json!(req.action));
        }
        self.emit(&format!("{family}.result"), data.clone()).await;
        self.emit(events::AGENT_EXEC_RESULT, data).await;
    }

    async fn result_denied(&self, req: &GodRequest, error: &str, reason: &str) {
        warn!(request_id = %req.request_id, action = %req.action, error, reason, "denied");
        self.result(req, json!({"ok": false, "error": error, "denied_reason": reason}))
            .await;
    }

    // -- Command execution --------------------------------------------------

    async fn exec_command(&self, req: &GodRequest, plan: actions::PlannedCommand) {
        let Some(cmd) = resolve_tool(&self.allowlist, plan.tool) else {
            self.result(
                req,
                json!({
                    "ok": false,
                    "error": "policy_denied",
                    "denied_code": DenyCode::NotAllowed.as_str(),
                    "denied_reason": format!("tool not allowlisted: {}", plan.tool),
                }),
            )
            .await;
            return;
        };
        let spec = plan.into_spec(cmd);

        if !self
            .intent(req, json!({"cmd": spec.cmd, "args": spec.args, "cwd": spec.cwd}))
            .await
        {
            return;
        }

        if let Err(denial) = fp_policy::check(&self.allowlist, &spec) {
            self.result(
                req,
                json!({
                    "ok": false,
                    "error": "policy_denied",
                    "denied_code": denial.code.as_str(),
                    "denied_reason": denial.detail,
                }),
            )
            .await;
            return;
        }

        let timeout = req
            .args
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        match fp_exec::run(&spec, timeout).await {
            Ok(outcome) => {
                self.result(req, outcome_json(&outcome)).await;
            }
            Err(err) => {
                self.result(
                    req,
                    json!({"ok": false, "error": "execution_failed", "message": err.to_string()}),
                )
                .await;
            }
        }
    }

    // -- Non-shell actions --------------------------------------------------

    async fn health_snapshot(&self, req: &GodRequest) {
        if !self.intent(req, json!({"kind": "host_snapshot"})).await {
            return;
        }
        let snap = HostSnapshot::collect();
        let data = json!({
            "ok": true,
            "request_id": req.request_id,
            "action": req.action,
            "node_id": self.identity.node_id,
            "snapshot": snap,
        });
        self.emit(events::NODE_HEALTH_SNAPSHOT, data.clone()).await;
        self.emit(events::AGENT_EXEC_RESULT, data).await;
    }

    async fn vault_verify(&self, req: &GodRequest) {
        if !self.intent(req, json!({"kind": "vault_probe"})).await {
            return;
        }
        let probe = Envelope::new(
            events::VAULT_VERIFY_PROBE,
            self.identity.node_id.clone(),
            json!({"request_id": req.request_id}),
        );
        let stored = self.vault.ingest(&probe).await.is_ok();
        self.result(req, json!({"ok": stored, "vault_verified": stored}))
            .await;
    }

    async fn rollcall(&self, req: &GodRequest) {
        if !self.intent(req, json!({"kind": "rollcall"})).await {
            return;
        }
        let modes = *self.modes.lock().expect("modes poisoned");
        self.result(
            req,
            json!({
                "ok": true,
                "node_id": self.identity.node_id,
                "device_id": self.identity.device_id,
                "role": self.identity.role,
                "platform": self.identity.platform,
                "frozen": modes.frozen,
                "quiet": modes.quiet,
            }),
        )
        .await;
    }

    async fn toggle_mode(&self, req: &GodRequest) {
        if !self.intent(req, json!({"kind": "mode_toggle"})).await {
            return;
        }
        let modes = {
            let mut modes = self.modes.lock().expect("modes poisoned");
            match req.action.as_str() {
                "panic.freeze.agents" => modes.frozen = true,
                "ritual.quiet.mode" => modes.quiet = true,
                "ritual.wake.mode" => {
                    modes.frozen = false;
                    modes.quiet = false;
                }
                _ => {}
            }
            *modes
        };
        info!(frozen = modes.frozen, quiet = modes.quiet, "modes updated");
        self.result(
            req,
            json!({"ok": true, "frozen": modes.frozen, "quiet": modes.quiet}),
        )
        .await;
    }

    async fn claim(&self, req: &GodRequest) {
        if !self.intent(req, json!({"kind": "claim"})).await {
            return;
        }
        let record = json!({
            "node_id": self.identity.node_id,
            "device_id": self.identity.device_id,
            "role": self.identity.role,
            "request_id": req.request_id,
            "args": req.args,
            "ts_ms": fp_core::now_ms(),
        });
        match persist_json_atomic(&self.claim_db_path, &record).await {
            Ok(()) => {
                self.result(
                    req,
                    json!({"ok": true, "claim_path": self.claim_db_path.display().to_string()}),
                )
                .await;
            }
            Err(err) => {
                self.result(
                    req,
                    json!({"ok": false, "error": "internal", "message": err.to_string()}),
                )
                .await;
            }
        }
    }

    async fn run_steps(&self, req: &GodRequest) {
        let steps: Vec<StepSpec> = match req
            .args
            .get("steps")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(steps)) => steps,
            _ => {
                self.result_denied(req, "bad_request", "steps[] required").await;
                return;
            }
        };
        let artifacts: Vec<PathBuf> = req
            .args
            .get("artifacts")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        if !self
            .intent(req, json!({"steps": steps.len(), "artifacts": artifacts.len()}))
            .await
        {
            return;
        }

        // All artifact paths must exist before any step runs.
        for artifact in &artifacts {
            if tokio::fs::metadata(artifact).await.is_err() {
                self.result(
                    req,
                    json!({
                        "ok": false,
                        "error": "bad_request",
                        "missing_artifact": artifact.display().to_string(),
                    }),
                )
                .await;
                return;
            }
        }

        for (index, step) in steps.iter().enumerate() {
            let spec = CommandSpec {
                cmd: step.cmd.clone(),
                args: step.args.clone(),
                cwd: step.cwd.clone().unwrap_or_else(|| self.work_dir.clone()),
            };
            if let Err(denial) = fp_policy::check(&self.allowlist, &spec) {
                self.result(
                    req,
                    json!({
                        "ok": false,
                        "error": "policy_denied",
                        "denied_code": denial.code.as_str(),
                        "failed_step": step,
                        "step_index": index,
                    }),
                )
                .await;
                return;
            }
            match fp_exec::run(&spec, self.default_timeout).await {
                Ok(outcome) if outcome.ok() => continue,
                Ok(outcome) => {
                    // Stop at the first non-zero exit.
                    self.result(
                        req,
                        json!({
                            "ok": false,
                            "error": "execution_failed",
                            "failed_step": step,
                            "step_index": index,
                            "exit_code": outcome.exit_code,
                            "timed_out": outcome.timed_out,
                            "stdout_sha256": outcome.stdout_sha256,
                            "stderr_sha256": outcome.stderr_sha256,
                        }),
                    )
                    .await;
                    return;
                }
                Err(err) => {
                    self.result(
                        req,
                        json!({
                            "ok": false,
                            "error": "execution_failed",
                            "failed_step": step,
                            "step_index": index,
                            "message": err.to_string(),
                        }),
                    )
                    .await;
                    return;
                }
            }
        }

        self.result(req, json!({"ok": true, "steps_run": steps.len()}))
            .await;
    }
}

/// Capability class gating an action; the three `node.*` actions are
/// gated by the class that owns their machinery.
fn gate_class(action: &str) -> ActionClass {
    match action {
        "node.claim" => ActionClass::Ritual,
        "node.flash" => ActionClass::Build,
        "node.health.request" => ActionClass::Snapshot,
        _ => ActionClass::of(action).unwrap_or(ActionClass::Ritual),
    }
}

fn outcome_json(outcome: &fp_exec::ExecOutcome) -> Value {
    json!({
        "ok": outcome.ok(),
        "exit_code": outcome.exit_code,
        "signal": outcome.signal,
        "timed_out": outcome.timed_out,
        "duration_ms": outcome.duration_ms,
        "stdout_sha256": outcome.stdout_sha256,
        "stderr_sha256": outcome.stderr_sha256,
        "stdout": truncate_chars(&outcome.stdout, RESULT_OUTPUT_CHARS),
        "stderr": truncate_chars(&outcome.stderr, RESULT_OUTPUT_CHARS),
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Atomic JSON persist: temp file in the same directory, then rename.
async fn persist_json_atomic(path: &PathBuf, value: &Value) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Consume the class topics until the bus closes.
pub async fn run(agent: Arc<Agent>, bus: Arc<dyn MessageBus>) -> Result<(), fp_bus::BusError> {
    let mut sub = bus.subscribe(CLASS_TOPICS).await?;
    info!(node_id = %agent.identity.node_id, "agent subscribed");
    while let Some(msg) = sub.recv().await {
        let req: GodRequest = match serde_json::from_value(msg.payload) {
            Ok(req) => req,
            Err(err) => {
                warn!(topic = %msg.topic, error = %err, "undecodable request dropped");
                continue;
            }
        };
        let agent = agent.clone();
        // Each message is an independent task; a slow child process must
        // not block the subscription.
        tokio::spawn(async move { agent.handle(req).await });
    }
    Ok(())
}

/// No-op on platforms without SIGHUP.
#[cfg(not(unix))]
pub fn spawn_reload_on_sighup(_agent: Arc<Agent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

/// Re-read the capability descriptor on SIGHUP.
#[cfg(unix)]
pub fn spawn_reload_on_sighup(agent: Arc<Agent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "SIGHUP handler unavailable; reload disabled");
                return;
            }
        };
        while hup.recv().await.is_some() {
            info!("SIGHUP: reloading capability matrix");
            agent.caps.reload(&agent.caps_path, &agent.identity.node_id);
        }
    })
}
