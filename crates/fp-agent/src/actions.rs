// SPDX-License-Identifier: MIT OR Apache-2.0
//! The action → command table and audit event naming.
//!
//! Actions that shell out are translated here into a tool alias plus an
//! argument builder; the alias is resolved to an absolute path through
//! the command allowlist, which stays the single source of truth for
//! where binaries live on a given host.

use fp_policy::{CommandAllowlist, CommandSpec};
use serde_json::Value;
use std::path::PathBuf;

/// The audit event family an action writes under (`<family>.intent` /
/// `<family>.result`).
pub fn event_family(action: &str) -> &'static str {
    if action.starts_with("maint.") {
        return "node.maintenance";
    }
    if action.starts_with("scan.") {
        return "node.scan";
    }
    if action.starts_with("panic.") {
        return "node.panic";
    }
    if action.starts_with("snapshot.") || action == "node.health.request" {
        return "node.health";
    }
    match action {
        "ritual.rollcall" | "node.claim" => "node.claim",
        "ritual.heartbeat.burst" => "node.health",
        "node.flash" | "build.flash.target" | "build.rollback.target" | "build.deploy.config" => {
            "node.flash"
        }
        a if a.starts_with("build.") => "node.build",
        _ => "node.ritual",
    }
}

/// A shell-out plan: the tool alias for the capability check plus the
/// arguments and working directory to run it with.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    /// Tool alias (`systemctl`, `nmap`, ...), matched against both the
    /// capability tool set and the allowlist keys' file names.
    pub tool: &'static str,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// Why a plan could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A required argument is missing or mistyped.
    MissingArg(&'static str),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingArg(name) => write!(f, "missing required arg: {name}"),
        }
    }
}

fn arg_str<'a>(args: &'a Value, key: &'static str) -> Result<&'a str, PlanError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(PlanError::MissingArg(key))
}

fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Build the command plan for a shell-out action.
///
/// Returns `Ok(None)` for actions that do not translate to a command.
pub fn plan_command(
    action: &str,
    args: &Value,
    work_dir: &PathBuf,
) -> Result<Option<PlannedCommand>, PlanError> {
    let cwd = args
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| work_dir.clone());

    let plan = |tool: &'static str, argv: Vec<String>| {
        Some(PlannedCommand {
            tool,
            args: argv,
            cwd: cwd.clone(),
        })
    };

    let planned = match action {
        "maint.restart.service" => {
            let unit = arg_str(args, "service")?;
            plan("systemctl", vec!["restart".into(), unit.into()])
        }
        "maint.status.service" => {
            let unit = arg_str(args, "service")?;
            plan("systemctl", vec!["status".into(), unit.into()])
        }
        "maint.logs.tail" => {
            let unit = arg_str(args, "service")?;
            let lines = arg_u64(args, "lines", 200);
            plan(
                "journalctl",
                vec![
                    "-u".into(),
                    unit.into(),
                    "-n".into(),
                    lines.to_string(),
                    "--no-pager".into(),
                ],
            )
        }
        "maint.disk.df" => plan("df", vec!["-h".into()]),
        "maint.net.ping" => {
            let target = arg_str(args, "target")?;
            let count = arg_u64(args, "count", 3);
            plan(
                "ping",
                vec!["-c".into(), count.to_string(), target.into()],
            )
        }
        "scan.lan.fast" => {
            let cidr = arg_str(args, "cidr")?;
            plan("nmap", vec!["-sn".into(), cidr.into()])
        }
        "scan.lan.ports.top" => {
            let target = arg_str(args, "target")?;
            let ports = arg_u64(args, "ports", 100);
            plan(
                "nmap",
                vec!["--top-ports".into(), ports.to_string(), target.into()],
            )
        }
        "scan.ble.sweep" => {
            let seconds = arg_u64(args, "seconds", 10);
            plan(
                "bluetoothctl",
                vec![
                    "--timeout".into(),
                    seconds.to_string(),
                    "scan".into(),
                    "on".into(),
                ],
            )
        }
        "scan.wifi.snapshot" => plan("iw", vec!["dev".into()]),
        "snapshot.services" => plan(
            "systemctl",
            vec![
                "list-units".into(),
                "--type=service".into(),
                "--state=running".into(),
                "--no-pager".into(),
            ],
        ),
        "snapshot.net.routes" => plan("ip", vec!["route".into(), "show".into()]),
        "panic.lockdown.egress" => plan(
            "iptables",
            vec!["-P".into(), "OUTPUT".into(), "DROP".into()],
        ),
        "panic.isolate.node" => {
            let iface = args
                .get("iface")
                .and_then(Value::as_str)
                .unwrap_or("wlan0");
            plan(
                "ip",
                vec!["link".into(), "set".into(), iface.into(), "down".into()],
            )
        }
        "panic.kill.switch" => plan("shutdown", vec!["-h".into(), "now".into()]),
        "build.version.report" => plan(
            "git",
            vec!["describe".into(), "--tags".into(), "--always".into()],
        ),
        _ => None,
    };
    Ok(planned)
}

/// Resolve a tool alias to the allowlisted absolute path whose file name
/// matches it.  No match means the tool is simply not allowed here.
pub fn resolve_tool(allowlist: &CommandAllowlist, tool: &str) -> Option<PathBuf> {
    allowlist
        .commands
        .keys()
        .find(|path| path.file_name().and_then(|n| n.to_str()) == Some(tool))
        .cloned()
}

impl PlannedCommand {
    /// Bind the plan to an absolute path, yielding the exec spec.
    pub fn into_spec(self, cmd: PathBuf) -> CommandSpec {
        CommandSpec {
            cmd,
            args: self.args,
            cwd: self.cwd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn families() {
        assert_eq!(event_family("maint.disk.df"), "node.maintenance");
        assert_eq!(event_family("scan.lan.fast"), "node.scan");
        assert_eq!(event_family("panic.kill.switch"), "node.panic");
        assert_eq!(event_family("snapshot.now"), "node.health");
        assert_eq!(event_family("node.health.request"), "node.health");
        assert_eq!(event_family("ritual.rollcall"), "node.claim");
        assert_eq!(event_family("node.claim"), "node.claim");
        assert_eq!(event_family("node.flash"), "node.flash");
        assert_eq!(event_family("build.flash.target"), "node.flash");
        assert_eq!(event_family("build.version.report"), "node.build");
        assert_eq!(event_family("ritual.quiet.mode"), "node.ritual");
    }

    #[test]
    fn maint_commands_build() {
        let work = std::env::temp_dir();
        let plan = plan_command(
            "maint.restart.service",
            &json!({"service": "nginx.service"}),
            &work,
        )
        .unwrap()
        .unwrap();
        assert_eq!(plan.tool, "systemctl");
        assert_eq!(plan.args, vec!["restart", "nginx.service"]);
        assert_eq!(plan.cwd, work);
    }

    #[test]
    fn missing_required_arg() {
        let work = std::env::temp_dir();
        let err = plan_command("maint.net.ping", &json!({}), &work).unwrap_err();
        assert_eq!(err, PlanError::MissingArg("target"));
    }

    #[test]
    fn defaults_fill_in() {
        let work = std::env::temp_dir();
        let plan = plan_command(
            "scan.lan.ports.top",
            &json!({"target": "10.0.0.5"}),
            &work,
        )
        .unwrap()
        .unwrap();
        assert_eq!(plan.args, vec!["--top-ports", "100", "10.0.0.5"]);
    }

    #[test]
    fn cwd_override_from_args() {
        let work = std::env::temp_dir();
        let plan = plan_command(
            "build.version.report",
            &json!({"cwd": "/srv/firmware"}),
            &work,
        )
        .unwrap()
        .unwrap();
        assert_eq!(plan.cwd, PathBuf::from("/srv/firmware"));
    }

    #[test]
    fn non_command_actions_plan_nothing() {
        let work = std::env::temp_dir();
        for action in ["snapshot.now", "ritual.rollcall", "node.claim", "node.flash"] {
            assert!(plan_command(action, &json!({}), &work).unwrap().is_none());
        }
    }

    #[test]
    fn tool_resolution_by_file_name() {
        let mut commands = BTreeMap::new();
        commands.insert(PathBuf::from("/usr/bin/systemctl"), Default::default());
        commands.insert(PathBuf::from("/bin/df"), Default::default());
        let allowlist = CommandAllowlist { commands };

        assert_eq!(
            resolve_tool(&allowlist, "df"),
            Some(PathBuf::from("/bin/df"))
        );
        assert_eq!(
            resolve_tool(&allowlist, "systemctl"),
            Some(PathBuf::from("/usr/bin/systemctl"))
        );
        assert_eq!(resolve_tool(&allowlist, "nmap"), None);
    }
}
