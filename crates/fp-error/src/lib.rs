// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for Fieldplane.
//!
//! Every plane error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context.  Use the builder returned by
//! [`PlaneError::new`] to construct errors fluently.
//!
//! The code set is closed: every public entry point in the plane returns
//! either success or one of these codes, and nothing else.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `snake_case` string that is guaranteed not
/// to change across patch releases; the strings double as the structured
/// `error` field on denial events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or malformed input; returned to the caller, not an incident.
    BadRequest,
    /// Action or command outside the static allowlist.
    NotAllowlisted,
    /// Per-class rate bucket exhausted.
    RateLimited,
    /// Replayed `request_id` within the dedupe window.
    Duplicate,
    /// Class/scope/tool not permitted by the capability descriptor.
    CapabilityDenied,
    /// Allowlist guard refused (CWD, subcommand, flag, target, path).
    PolicyDenied,
    /// Network/timeout/5xx; retried with bounded backoff at the caller.
    TransientIo,
    /// Vault ingest unreachable where vault-first is required.
    FailClosed,
    /// Child exited non-zero or was killed by timeout.
    ExecutionFailed,
    /// Logic invariant broken; logged and surfaced, never swallowed.
    Internal,
}

impl ErrorCode {
    /// Stable `&'static str` representation of the code (e.g. `"bad_request"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotAllowlisted => "not_allowlisted",
            Self::RateLimited => "rate_limited",
            Self::Duplicate => "duplicate",
            Self::CapabilityDenied => "capability_denied",
            Self::PolicyDenied => "policy_denied",
            Self::TransientIo => "transient_io",
            Self::FailClosed => "fail_closed",
            Self::ExecutionFailed => "execution_failed",
            Self::Internal => "internal",
        }
    }

    /// Whether callers should retry with backoff rather than give up.
    ///
    /// Only `transient_io` qualifies; everything else is terminal for the
    /// request that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo)
    }

    /// Whether the failure must be accompanied by a `.denied` audit event.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::NotAllowlisted
                | Self::RateLimited
                | Self::Duplicate
                | Self::CapabilityDenied
                | Self::PolicyDenied
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlaneError
// ---------------------------------------------------------------------------

/// Unified Fieldplane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use fp_error::{ErrorCode, PlaneError};
///
/// let err = PlaneError::new(ErrorCode::RateLimited, "rate limit exceeded for build")
///     .with_context("class", "build")
///     .with_context("cap_per_min", 3);
/// ```
pub struct PlaneError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PlaneError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for a `bad_request` error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Shorthand for an `internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether callers should retry with backoff.
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl fmt::Debug for PlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PlaneError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for PlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PlaneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`PlaneError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaneErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&PlaneError> for PlaneErrorDto {
    fn from(err: &PlaneError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
