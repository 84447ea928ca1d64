// SPDX-License-Identifier: MIT OR Apache-2.0
//! Messaging topics and event type names.
//!
//! Topics are the bus-side addressing; event types are the vault-side
//! namespaces.  Both are closed sets.

use crate::action::ActionClass;

/// Mirror topic carrying every dispatched request.
pub const GOD_BUTTON: &str = "god.button";

/// Class topics, one per capability class.
pub const OPS_PANIC: &str = "ops.panic";
/// Snapshot class topic.
pub const OPS_SNAPSHOT: &str = "ops.snapshot";
/// Maintenance class topic.
pub const OPS_MAINT: &str = "ops.maint";
/// Scan class topic.
pub const OPS_SCAN: &str = "ops.scan";
/// Build class topic.
pub const OPS_BUILD: &str = "ops.build";
/// Ritual class topic.
pub const OPS_RITUAL: &str = "ops.ritual";
/// Node claim topic.
pub const OPS_CLAIM: &str = "ops.claim";
/// Node flash topic.
pub const OPS_FLASH: &str = "ops.flash";
/// Node health request topic.
pub const OPS_HEALTH_REQUEST: &str = "ops.health.request";

/// All topics an agent subscribes to.
pub const AGENT_TOPICS: &[&str] = &[
    GOD_BUTTON,
    OPS_PANIC,
    OPS_SNAPSHOT,
    OPS_MAINT,
    OPS_SCAN,
    OPS_BUILD,
    OPS_RITUAL,
    OPS_CLAIM,
    OPS_FLASH,
    OPS_HEALTH_REQUEST,
];

/// The class-specific topic a normalized action is routed on.
pub fn class_topic(action: &str) -> Option<&'static str> {
    match action {
        "node.claim" => return Some(OPS_CLAIM),
        "node.flash" => return Some(OPS_FLASH),
        "node.health.request" => return Some(OPS_HEALTH_REQUEST),
        _ => {}
    }
    match ActionClass::of(action)? {
        ActionClass::Panic => Some(OPS_PANIC),
        ActionClass::Snapshot => Some(OPS_SNAPSHOT),
        ActionClass::Maint => Some(OPS_MAINT),
        ActionClass::Scan => Some(OPS_SCAN),
        ActionClass::Build => Some(OPS_BUILD),
        ActionClass::Ritual => Some(OPS_RITUAL),
        // Remaining node.* actions are the three handled above.
        ActionClass::Node => None,
    }
}

/// Event type names written by the router and agents.
pub mod events {
    /// Router wrote the normalized request before publishing.
    pub const GOD_INTENT: &str = "control.god_button.intent";
    /// Router finished a dispatch (or a dry run).
    pub const GOD_RESULT: &str = "control.god_button.result";
    /// Router refused a request.
    pub const GOD_DENIED: &str = "control.god_button.denied";
    /// Agent-side unified execution intent.
    pub const AGENT_EXEC_INTENT: &str = "agent.exec.intent";
    /// Agent-side unified execution result.
    pub const AGENT_EXEC_RESULT: &str = "agent.exec.result";
    /// Agent refused an action on capability grounds.
    pub const AGENT_CAPABILITY_DENIED: &str = "agent.capability.denied";
    /// SSH guard wrote an intent before executing.
    pub const SSH_INTENT: &str = "agent.ssh.intent";
    /// SSH guard execution result.
    pub const SSH_RESULT: &str = "agent.ssh.result";
    /// SSH guard refused a command.
    pub const SSH_DENIED: &str = "agent.ssh.denied";
    /// Host health snapshot payload.
    pub const NODE_HEALTH_SNAPSHOT: &str = "node.health.snapshot";
    /// Vault round-trip probe.
    pub const VAULT_VERIFY_PROBE: &str = "vault.verify.probe";
    /// BLE device resolution per observation.
    pub const BLE_DEVICE_SEEN: &str = "ble.device.seen";
    /// Two BLE devices collapsed into one.
    pub const BLE_DEVICE_MERGED: &str = "ble.device.merged";
}
