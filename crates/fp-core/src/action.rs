// SPDX-License-Identifier: MIT OR Apache-2.0
//! The static action allowlist and capability class mapping.
//!
//! The allowlist is the exact set the router and every agent accept; an
//! action outside it never produces bus traffic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every action an operator gesture may name.
pub const ACTION_ALLOWLIST: &[&str] = &[
    "panic.freeze.agents",
    "panic.lockdown.egress",
    "panic.isolate.node",
    "panic.kill.switch",
    "snapshot.now",
    "snapshot.services",
    "snapshot.net.routes",
    "snapshot.vault.verify",
    "maint.restart.service",
    "maint.status.service",
    "maint.logs.tail",
    "maint.disk.df",
    "maint.net.ping",
    "scan.lan.fast",
    "scan.lan.ports.top",
    "scan.ble.sweep",
    "scan.wifi.snapshot",
    "build.version.report",
    "build.flash.target",
    "build.rollback.target",
    "build.deploy.config",
    "ritual.rollcall",
    "ritual.heartbeat.burst",
    "ritual.quiet.mode",
    "ritual.wake.mode",
    "node.claim",
    "node.flash",
    "node.health.request",
];

/// Whether `action` is a member of the static allowlist.
pub fn is_allowlisted(action: &str) -> bool {
    ACTION_ALLOWLIST.contains(&action)
}

/// Capability class: the first dotted segment of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Emergency controls.
    Panic,
    /// Host and vault health snapshots.
    Snapshot,
    /// Service maintenance commands.
    Maint,
    /// Network and radio scans.
    Scan,
    /// Build, flash, and deploy operations.
    Build,
    /// Coordination rituals (rollcall, heartbeat, modes).
    Ritual,
    /// Node-scoped claims, flashes, and health requests.
    Node,
}

impl ActionClass {
    /// Class of an action, derived from its first dotted segment.
    ///
    /// Returns `None` for segments outside the closed class set.
    pub fn of(action: &str) -> Option<Self> {
        let head = action.split('.').next().unwrap_or_default();
        match head {
            "panic" => Some(Self::Panic),
            "snapshot" => Some(Self::Snapshot),
            "maint" => Some(Self::Maint),
            "scan" => Some(Self::Scan),
            "build" => Some(Self::Build),
            "ritual" => Some(Self::Ritual),
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    /// Stable lowercase name, matching the capability descriptor keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Snapshot => "snapshot",
            Self::Maint => "maint",
            Self::Scan => "scan",
            Self::Build => "build",
            Self::Ritual => "ritual",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_is_exact() {
        assert_eq!(ACTION_ALLOWLIST.len(), 28);
        assert!(is_allowlisted("ritual.rollcall"));
        assert!(is_allowlisted("node.health.request"));
        assert!(!is_allowlisted("maint.rm.rf"));
        assert!(!is_allowlisted(""));
    }

    #[test]
    fn every_allowlisted_action_has_a_class() {
        for action in ACTION_ALLOWLIST {
            assert!(
                ActionClass::of(action).is_some(),
                "no class for {action}"
            );
        }
    }

    #[test]
    fn class_of_first_segment() {
        assert_eq!(ActionClass::of("panic.freeze.agents"), Some(ActionClass::Panic));
        assert_eq!(ActionClass::of("node.claim"), Some(ActionClass::Node));
        assert_eq!(ActionClass::of("shell.exec"), None);
    }
}
