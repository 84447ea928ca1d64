// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability descriptor loading and fail-closed reload.
//!
//! An agent's capability matrix decides which action classes it will run,
//! under which scopes, with which tools.  A missing or malformed file
//! yields the fail-closed default: everything disabled except `snapshot`.
//! Reload swaps an immutable descriptor behind [`CapabilityCell`];
//! readers clone an `Arc` and never block a swap.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fp_core::{ActionClass, Scope};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// What one capability class is allowed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassGrant {
    /// Whether the class runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Scopes the class accepts; empty means any scope.
    #[serde(default)]
    pub scopes: BTreeSet<Scope>,
    /// Tool aliases the class may invoke; empty means any allowlisted tool.
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

/// The full capability matrix loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMatrix {
    /// Node this descriptor belongs to.
    #[serde(default)]
    pub node_id: String,
    /// Roles the node plays.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Class name → grant.
    #[serde(default)]
    pub capabilities: BTreeMap<String, ClassGrant>,
}

/// Why the matrix refused an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityDenial {
    /// The class is absent or disabled.
    ClassDisabled(ActionClass),
    /// The request scope is not in the class's scope set.
    ScopeDenied(ActionClass, Scope),
    /// The concrete tool is not in the class's tool set.
    ToolDenied(ActionClass, String),
}

impl CapabilityDenial {
    /// The `denied_reason` string written to the audit event.
    pub fn reason(&self) -> String {
        match self {
            Self::ClassDisabled(class) => format!("capability disabled: {class}"),
            Self::ScopeDenied(class, scope) => {
                format!("scope not permitted for {class}: {scope}")
            }
            Self::ToolDenied(class, tool) => format!("tool not permitted for {class}: {tool}"),
        }
    }
}

/// Errors loading a descriptor file.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// File unreadable.
    #[error("capability file unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// File present but not a valid descriptor.
    #[error("capability file malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CapabilityMatrix {
    /// The fail-closed default: all classes disabled except `snapshot`.
    pub fn fail_closed(node_id: impl Into<String>) -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            ActionClass::Snapshot.as_str().to_string(),
            ClassGrant {
                enabled: true,
                scopes: BTreeSet::new(),
                tools: BTreeSet::new(),
            },
        );
        Self {
            node_id: node_id.into(),
            roles: Vec::new(),
            capabilities,
        }
    }

    /// Load and validate a descriptor from `path`.
    pub fn load(path: &Path) -> Result<Self, CapabilityError> {
        let raw = std::fs::read_to_string(path)?;
        let matrix: Self = serde_json::from_str(&raw)?;
        Ok(matrix)
    }

    /// Whether `class` may run under `scope` with `tool`.
    ///
    /// Empty scope/tool sets are wildcards; a non-empty set is a strict
    /// membership test.
    pub fn allows(
        &self,
        class: ActionClass,
        scope: Scope,
        tool: Option<&str>,
    ) -> Result<(), CapabilityDenial> {
        let grant = self
            .capabilities
            .get(class.as_str())
            .filter(|g| g.enabled)
            .ok_or(CapabilityDenial::ClassDisabled(class))?;

        if !grant.scopes.is_empty() && !grant.scopes.contains(&scope) {
            return Err(CapabilityDenial::ScopeDenied(class, scope));
        }
        if let Some(tool) = tool {
            if !grant.tools.is_empty() && !grant.tools.contains(tool) {
                return Err(CapabilityDenial::ToolDenied(class, tool.to_string()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reloadable cell
// ---------------------------------------------------------------------------

struct CellState {
    matrix: Arc<CapabilityMatrix>,
    /// Whether `matrix` came from a successful file load (as opposed to the
    /// fail-closed default).  Governs what a failed reload falls back to.
    loaded_ok: bool,
}

/// RCU-style holder for the current capability matrix.
pub struct CapabilityCell {
    state: RwLock<CellState>,
}

impl CapabilityCell {
    /// Initialize from `path`, falling back to the fail-closed default.
    pub fn init(path: &Path, node_id: &str) -> Self {
        let (matrix, loaded_ok) = match CapabilityMatrix::load(path) {
            Ok(m) => {
                info!(path = %path.display(), "capability matrix loaded");
                (m, true)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "capability load failed; fail-closed default");
                (CapabilityMatrix::fail_closed(node_id), false)
            }
        };
        Self {
            state: RwLock::new(CellState {
                matrix: Arc::new(matrix),
                loaded_ok,
            }),
        }
    }

    /// A cell pinned to a fixed matrix (tests, embedded use).
    pub fn fixed(matrix: CapabilityMatrix) -> Self {
        Self {
            state: RwLock::new(CellState {
                matrix: Arc::new(matrix),
                loaded_ok: true,
            }),
        }
    }

    /// Snapshot of the current matrix.
    pub fn get(&self) -> Arc<CapabilityMatrix> {
        self.state.read().expect("capability cell poisoned").matrix.clone()
    }

    /// Re-read the descriptor.
    ///
    /// On parse failure the prior in-memory copy is kept only if it was
    /// itself a valid load; otherwise the cell reverts to the fail-closed
    /// default and the reason is logged.
    pub fn reload(&self, path: &Path, node_id: &str) {
        match CapabilityMatrix::load(path) {
            Ok(matrix) => {
                let mut state = self.state.write().expect("capability cell poisoned");
                state.matrix = Arc::new(matrix);
                state.loaded_ok = true;
                info!(path = %path.display(), "capability matrix reloaded");
            }
            Err(err) => {
                let mut state = self.state.write().expect("capability cell poisoned");
                if state.loaded_ok {
                    warn!(error = %err, "capability reload failed; keeping prior valid matrix");
                } else {
                    warn!(error = %err, "capability reload failed; reverting to fail-closed default");
                    state.matrix = Arc::new(CapabilityMatrix::fail_closed(node_id));
                }
            }
        }
    }
}
