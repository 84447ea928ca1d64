// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command allowlist and guard checks.
//!
//! The same discipline protects the execution agent and the SSH guard: a
//! command may only run when its absolute path is a key in the allowlist
//! and every argument survives the rule attached to that key.  Denials
//! carry a typed code so the audit trail says exactly which guard refused.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// One allowlist entry, keyed by the command's absolute path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowRule {
    /// Maximum argument count.
    pub max_args: usize,
    /// CWD must resolve (realpath) underneath one of these.
    #[serde(default)]
    pub cwd_roots: Vec<PathBuf>,
    /// When present, the first argument must be one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommands: Option<BTreeSet<String>>,
    /// When present and non-empty, every flag must be a member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_flags: Option<BTreeSet<String>>,
    /// Flags refused outright.
    #[serde(default)]
    pub deny_flags: BTreeSet<String>,
    /// When present, unit-style operands must be members (`systemctl`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<BTreeSet<String>>,
    /// When present, IP/CIDR operands must fall inside one of these
    /// networks; non-IP operands must match an entry exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    /// When present, absolute-path operands must start with one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefixes: Option<Vec<PathBuf>>,
}

/// The loaded allowlist: absolute command path → rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandAllowlist {
    /// Rules keyed by absolute command path.
    pub commands: BTreeMap<PathBuf, AllowRule>,
}

/// A strictly-typed command descriptor, the only shape that reaches exec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Absolute path of the binary.
    pub cmd: PathBuf,
    /// Arguments, never shell-interpreted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// Errors loading the allowlist file.  Any of these means fail-closed.
#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    /// File unreadable.
    #[error("allowlist unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// File present but schema-invalid.
    #[error("allowlist malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CommandAllowlist {
    /// Load from a JSON file.  Callers treat every error as fail-closed.
    pub fn load(path: &Path) -> Result<Self, AllowlistError> {
        let raw = std::fs::read_to_string(path)?;
        let list: Self = serde_json::from_str(&raw)?;
        Ok(list)
    }
}

// ---------------------------------------------------------------------------
// Denials
// ---------------------------------------------------------------------------

/// Which guard refused, as written to `agent.ssh.denied` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyCode {
    /// Command not an allowlist key (or not absolute).
    NotAllowed,
    /// Too many arguments.
    ArgsLimit,
    /// CWD failed realpath containment.
    CwdDenied,
    /// First argument not an allowed subcommand.
    SubcommandDenied,
    /// A flag is on the deny list.
    FlagDenied,
    /// A flag is outside a non-empty allow list.
    FlagNotAllowed,
    /// A unit operand is outside the unit allowlist.
    UnitDenied,
    /// An IP/CIDR operand falls outside every allowed network.
    TargetDenied,
    /// An absolute-path operand is outside every allowed prefix.
    PathDenied,
    /// Vault ingest unreachable where vault-first is required.
    VaultDownFailClosed,
}

impl DenyCode {
    /// Stable string form (e.g. `"CWD_DENIED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAllowed => "NOT_ALLOWED",
            Self::ArgsLimit => "ARGS_LIMIT",
            Self::CwdDenied => "CWD_DENIED",
            Self::SubcommandDenied => "SUBCOMMAND_DENIED",
            Self::FlagDenied => "FLAG_DENIED",
            Self::FlagNotAllowed => "FLAG_NOT_ALLOWED",
            Self::UnitDenied => "UNIT_DENIED",
            Self::TargetDenied => "TARGET_DENIED",
            Self::PathDenied => "PATH_DENIED",
            Self::VaultDownFailClosed => "VAULT_DOWN_FAIL_CLOSED",
        }
    }
}

impl fmt::Display for DenyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy refusal: the code plus what tripped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// Typed code.
    pub code: DenyCode,
    /// The offending value (flag, path, target, ...).
    pub detail: String,
}

impl Denial {
    fn new(code: DenyCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Run every guard against `spec`, in the order the codes are defined.
pub fn check(allowlist: &CommandAllowlist, spec: &CommandSpec) -> Result<(), Denial> {
    if !spec.cmd.is_absolute() {
        return Err(Denial::new(DenyCode::NotAllowed, spec.cmd.display().to_string()));
    }
    let rule = allowlist
        .commands
        .get(&spec.cmd)
        .ok_or_else(|| Denial::new(DenyCode::NotAllowed, spec.cmd.display().to_string()))?;

    if spec.args.len() > rule.max_args {
        return Err(Denial::new(
            DenyCode::ArgsLimit,
            format!("{} > {}", spec.args.len(), rule.max_args),
        ));
    }

    check_cwd(rule, &spec.cwd)?;

    let mut operands: Vec<&str> = Vec::new();
    for (i, arg) in spec.args.iter().enumerate() {
        if arg.starts_with('-') {
            check_flag(rule, arg)?;
        } else if i == 0 && rule.subcommands.is_some() {
            let subs = rule.subcommands.as_ref().expect("checked");
            if !subs.contains(arg.as_str()) {
                return Err(Denial::new(DenyCode::SubcommandDenied, arg.clone()));
            }
        } else {
            operands.push(arg);
        }
    }
    // A subcommand requirement with no subcommand present is a refusal too.
    if let Some(subs) = &rule.subcommands {
        let has_sub = spec
            .args
            .first()
            .map(|a| subs.contains(a.as_str()))
            .unwrap_or(false);
        if !has_sub {
            return Err(Denial::new(DenyCode::SubcommandDenied, "<none>"));
        }
    }

    for operand in operands {
        check_operand(rule, operand)?;
    }
    Ok(())
}

fn check_cwd(rule: &AllowRule, cwd: &Path) -> Result<(), Denial> {
    if rule.cwd_roots.is_empty() {
        return Ok(());
    }
    // Fail-closed: an unresolvable CWD never runs.
    let real = cwd
        .canonicalize()
        .map_err(|_| Denial::new(DenyCode::CwdDenied, cwd.display().to_string()))?;
    for root in &rule.cwd_roots {
        let root_real = match root.canonicalize() {
            Ok(r) => r,
            Err(_) => continue,
        };
        if real.starts_with(&root_real) {
            return Ok(());
        }
    }
    Err(Denial::new(DenyCode::CwdDenied, real.display().to_string()))
}

fn check_flag(rule: &AllowRule, arg: &str) -> Result<(), Denial> {
    // `--top-ports=100` matches the allowlist entry `--top-ports`.
    let flag = arg.split('=').next().unwrap_or(arg);
    if rule.deny_flags.contains(flag) {
        return Err(Denial::new(DenyCode::FlagDenied, arg));
    }
    if let Some(allowed) = &rule.allow_flags {
        if !allowed.is_empty() && !allowed.contains(flag) {
            return Err(Denial::new(DenyCode::FlagNotAllowed, arg));
        }
    }
    Ok(())
}

fn check_operand(rule: &AllowRule, operand: &str) -> Result<(), Denial> {
    if let Some(prefixes) = &rule.path_prefixes {
        if operand.starts_with('/') {
            let p = Path::new(operand);
            if !prefixes.iter().any(|prefix| p.starts_with(prefix)) {
                return Err(Denial::new(DenyCode::PathDenied, operand));
            }
            return Ok(());
        }
    }
    if let Some(targets) = &rule.targets {
        if let Some(denial) = check_target(targets, operand) {
            return Err(denial);
        }
        return Ok(());
    }
    if let Some(units) = &rule.units {
        if !units.contains(operand) {
            return Err(Denial::new(DenyCode::UnitDenied, operand));
        }
    }
    Ok(())
}

fn check_target(targets: &[String], operand: &str) -> Option<Denial> {
    // Numeric-looking operands (counts, port totals) are flag values, not
    // targets.
    if operand.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(net) = IpNet::from_str(operand) {
        for t in targets {
            if let Ok(allowed) = IpNet::from_str(t) {
                if allowed.contains(&net) {
                    return None;
                }
            }
        }
        return Some(Denial::new(DenyCode::TargetDenied, operand));
    }
    if let Ok(ip) = IpAddr::from_str(operand) {
        for t in targets {
            if let Ok(allowed) = IpNet::from_str(t) {
                if allowed.contains(&ip) {
                    return None;
                }
            }
            if let Ok(allowed_ip) = IpAddr::from_str(t) {
                if allowed_ip == ip {
                    return None;
                }
            }
        }
        return Some(Denial::new(DenyCode::TargetDenied, operand));
    }
    // Hostname operand: exact-match against non-CIDR entries.
    if targets.iter().any(|t| t == operand) {
        return None;
    }
    Some(Denial::new(DenyCode::TargetDenied, operand))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn systemctl_rule() -> AllowRule {
        AllowRule {
            max_args: 4,
            cwd_roots: vec![std::env::temp_dir()],
            subcommands: Some(
                ["status", "restart", "is-active"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            units: Some(
                ["nginx.service", "vault.service"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            deny_flags: ["--force"].into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    fn allowlist() -> CommandAllowlist {
        let mut commands = BTreeMap::new();
        commands.insert(PathBuf::from("/usr/bin/systemctl"), systemctl_rule());
        commands.insert(
            PathBuf::from("/usr/bin/nmap"),
            AllowRule {
                max_args: 6,
                cwd_roots: vec![std::env::temp_dir()],
                allow_flags: Some(
                    ["-sn", "--top-ports"].into_iter().map(String::from).collect(),
                ),
                targets: Some(vec!["10.0.0.0/24".to_string(), "lab-bench".to_string()]),
                ..Default::default()
            },
        );
        commands.insert(
            PathBuf::from("/usr/bin/tail"),
            AllowRule {
                max_args: 4,
                cwd_roots: vec![std::env::temp_dir()],
                allow_flags: Some(["-n"].into_iter().map(String::from).collect()),
                path_prefixes: Some(vec![PathBuf::from("/var/vault/events")]),
                ..Default::default()
            },
        );
        CommandAllowlist { commands }
    }

    fn spec(cmd: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            cmd: PathBuf::from(cmd),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
        }
    }

    #[test]
    fn unknown_command_not_allowed() {
        let denial = check(&allowlist(), &spec("/bin/bash", &["-c", "true"])).unwrap_err();
        assert_eq!(denial.code, DenyCode::NotAllowed);
    }

    #[test]
    fn relative_command_not_allowed() {
        let denial = check(&allowlist(), &spec("systemctl", &["status"])).unwrap_err();
        assert_eq!(denial.code, DenyCode::NotAllowed);
    }

    #[test]
    fn args_limit_enforced() {
        let denial = check(
            &allowlist(),
            &spec("/usr/bin/systemctl", &["status", "a", "b", "c", "d"]),
        )
        .unwrap_err();
        assert_eq!(denial.code, DenyCode::ArgsLimit);
    }

    #[test]
    fn cwd_containment() {
        let mut s = spec("/usr/bin/systemctl", &["status", "nginx.service"]);
        s.cwd = PathBuf::from("/");
        let denial = check(&allowlist(), &s).unwrap_err();
        assert_eq!(denial.code, DenyCode::CwdDenied);
    }

    #[test]
    fn nonexistent_cwd_is_denied() {
        let mut s = spec("/usr/bin/systemctl", &["status", "nginx.service"]);
        s.cwd = PathBuf::from("/definitely/not/here");
        let denial = check(&allowlist(), &s).unwrap_err();
        assert_eq!(denial.code, DenyCode::CwdDenied);
    }

    #[test]
    fn subcommand_membership() {
        let ok = spec("/usr/bin/systemctl", &["status", "nginx.service"]);
        check(&allowlist(), &ok).unwrap();

        let denial =
            check(&allowlist(), &spec("/usr/bin/systemctl", &["mask", "nginx.service"]))
                .unwrap_err();
        assert_eq!(denial.code, DenyCode::SubcommandDenied);

        let none = check(&allowlist(), &spec("/usr/bin/systemctl", &[])).unwrap_err();
        assert_eq!(none.code, DenyCode::SubcommandDenied);
    }

    #[test]
    fn unit_allowlist() {
        let denial = check(
            &allowlist(),
            &spec("/usr/bin/systemctl", &["restart", "sshd.service"]),
        )
        .unwrap_err();
        assert_eq!(denial.code, DenyCode::UnitDenied);
    }

    #[test]
    fn deny_flag_wins() {
        let denial = check(
            &allowlist(),
            &spec("/usr/bin/systemctl", &["restart", "--force", "nginx.service"]),
        )
        .unwrap_err();
        assert_eq!(denial.code, DenyCode::FlagDenied);
    }

    #[test]
    fn flag_allowlist() {
        let ok = spec("/usr/bin/nmap", &["-sn", "10.0.0.0/24"]);
        check(&allowlist(), &ok).unwrap();

        let denial = check(&allowlist(), &spec("/usr/bin/nmap", &["-A", "10.0.0.5"]))
            .unwrap_err();
        assert_eq!(denial.code, DenyCode::FlagNotAllowed);

        // `--top-ports=100` matches the bare flag entry.
        check(
            &allowlist(),
            &spec("/usr/bin/nmap", &["--top-ports=100", "10.0.0.5"]),
        )
        .unwrap();
    }

    #[test]
    fn cidr_targets() {
        check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "10.0.0.17"])).unwrap();
        check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "10.0.0.0/25"])).unwrap();

        let outside = check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "192.168.1.1"]))
            .unwrap_err();
        assert_eq!(outside.code, DenyCode::TargetDenied);

        let wide = check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "10.0.0.0/16"]))
            .unwrap_err();
        assert_eq!(wide.code, DenyCode::TargetDenied);
    }

    #[test]
    fn hostname_targets_exact_match() {
        check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "lab-bench"])).unwrap();
        let denial = check(&allowlist(), &spec("/usr/bin/nmap", &["-sn", "evil-host"]))
            .unwrap_err();
        assert_eq!(denial.code, DenyCode::TargetDenied);
    }

    #[test]
    fn numeric_flag_values_are_not_targets() {
        check(
            &allowlist(),
            &spec("/usr/bin/nmap", &["--top-ports", "100", "10.0.0.5"]),
        )
        .unwrap();
    }

    #[test]
    fn path_prefixes() {
        check(
            &allowlist(),
            &spec(
                "/usr/bin/tail",
                &["-n", "400", "/var/vault/events/2026-08-01/ingest.ndjson"],
            ),
        )
        .unwrap();

        let denial = check(
            &allowlist(),
            &spec("/usr/bin/tail", &["-n", "400", "/etc/shadow"]),
        )
        .unwrap_err();
        assert_eq!(denial.code, DenyCode::PathDenied);
    }

    #[test]
    fn load_fail_closed_on_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.json");
        std::fs::write(&path, "{oops").unwrap();
        assert!(CommandAllowlist::load(&path).is_err());
        assert!(CommandAllowlist::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn deny_codes_stable_strings() {
        assert_eq!(DenyCode::VaultDownFailClosed.as_str(), "VAULT_DOWN_FAIL_CLOSED");
        assert_eq!(DenyCode::FlagNotAllowed.as_str(), "FLAG_NOT_ALLOWED");
        let json = serde_json::to_string(&DenyCode::CwdDenied).unwrap();
        assert_eq!(json, r#""CWD_DENIED""#);
    }
}
