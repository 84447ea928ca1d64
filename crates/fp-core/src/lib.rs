// SPDX-License-Identifier: MIT OR Apache-2.0
//! fp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Fieldplane.
//!
//! Every component reads or writes the shapes defined here: the event
//! [`Envelope`] that lands in the vault, the operator [`GodRequest`] that
//! flows through the router, the [`action`] allowlist, and the [`topics`]
//! a dispatched request is published on.

/// The static action allowlist and class mapping.
pub mod action;
/// The append-only event envelope.
pub mod envelope;
/// Operator request shapes and normalization.
pub mod request;
/// Messaging topics and event type names.
pub mod topics;

pub use action::{ActionClass, is_allowlisted};
pub use envelope::{Envelope, EnvelopeFieldError};
pub use request::{GodRequest, RawRequest, Scope};

/// Milliseconds since the Unix epoch on the producer clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
