// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operator request shapes and normalization.
//!
//! The router accepts a lenient [`RawRequest`] (operators and legacy
//! clients send all sorts) and normalizes it into a [`GodRequest`] before
//! anything else looks at it.  Agents only ever see the normalized form.

use crate::action;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// The intended recipient set for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Every agent.
    All,
    /// Exactly one node, named by `target`.
    Node,
    /// Agents whose role is `tier1`.
    Tier1,
    /// macOS hosts.
    Mac,
    /// Raspberry Pi hosts.
    Pi,
}

impl Scope {
    /// Stable lowercase name, matching capability descriptor scope lists.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Node => "node",
            Self::Tier1 => "tier1",
            Self::Mac => "mac",
            Self::Pi => "pi",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operator client actually sent.  Everything is optional; the
/// router fills, translates, and rejects as needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRequest {
    /// Opaque id, unique within a 10-minute window; generated if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Allowlisted action name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Legacy operator shortcut (`whoami`, `panic`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// Recipient scope; defaults to `all`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    /// Node identifier; required when `scope` is `node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free text, logged, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Action-specific payload; `dry_run: true` is universal.
    #[serde(default)]
    pub args: Value,
    /// Producer clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,
}

/// A normalized operator request, as dispatched and audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GodRequest {
    /// Opaque id, unique within the dedupe window.
    pub request_id: String,
    /// Allowlisted action name.
    pub action: String,
    /// Recipient scope.
    pub scope: Scope,
    /// Node identifier when `scope` is `node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free text, logged, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Action-specific payload.
    #[serde(default)]
    pub args: Value,
    /// Producer clock.
    pub ts_ms: i64,
}

/// Why a raw request could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// Neither `action` nor a recognized legacy `op` was present.
    MissingAction,
    /// `scope` is `node` but `target` is absent.
    MissingTarget,
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAction => write!(f, "request has no action"),
            Self::MissingTarget => write!(f, "scope=node requires a target"),
        }
    }
}

impl std::error::Error for NormalizeError {}

impl RawRequest {
    /// Normalize into a [`GodRequest`].
    ///
    /// Fills `request_id` when absent, translates legacy operator
    /// shortcuts (`op: "whoami"` ⇒ `ritual.rollcall`, `op: "panic"` ⇒
    /// `panic.freeze.agents`), defaults scope to `all`, and stamps the
    /// producer clock when the caller did not.  Allowlist membership is
    /// checked later in the pipeline, not here.
    pub fn normalize(self, now_ms: i64) -> Result<GodRequest, NormalizeError> {
        let action = match (self.action, self.op.as_deref()) {
            (Some(a), _) => a,
            (None, Some("whoami")) => "ritual.rollcall".to_string(),
            (None, Some("panic")) => "panic.freeze.agents".to_string(),
            (None, _) => return Err(NormalizeError::MissingAction),
        };

        let scope = self.scope.unwrap_or(Scope::All);
        if scope == Scope::Node && self.target.is_none() {
            return Err(NormalizeError::MissingTarget);
        }

        Ok(GodRequest {
            request_id: self
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            action,
            scope,
            target: self.target,
            reason: self.reason,
            args: self.args,
            ts_ms: self.ts_ms.unwrap_or(now_ms),
        })
    }
}

impl GodRequest {
    /// Whether the universal `args.dry_run` flag is set.
    pub fn dry_run(&self) -> bool {
        self.args
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this request names an allowlisted action.
    pub fn is_allowlisted(&self) -> bool {
        action::is_allowlisted(&self.action)
    }
}
