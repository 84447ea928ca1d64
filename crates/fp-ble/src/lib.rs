// SPDX-License-Identifier: MIT OR Apache-2.0
//! fp-ble
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Fingerprint-based BLE device identity over an observation stream.
//!
//! Random BLE addresses rotate; advertised structure mostly does not.
//! Each observation is normalized, its manufacturer payload masked down to
//! the structurally stable bytes, and hashed into a stable fingerprint
//! plus an address fingerprint.  The [`registry`] resolves fingerprints to
//! persistent devices, scores near-matches, and collapses split
//! identities inside a short merge window.

/// Fingerprint derivation and device-id encoding.
pub mod fingerprint;
/// Observation normalization and manufacturer-data masking.
pub mod norm;
/// The persistent device registry.
pub mod registry;

pub use fingerprint::{Fingerprints, device_id_for};
pub use norm::{AddrType, NormalizedObservation};
pub use registry::{BleRegistry, MergedEvent, ObserveOutcome, RegistryError, SeenEvent};

use serde::{Deserialize, Serialize};

/// A raw BLE observation as reported by a scanner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BleObservation {
    /// Advertised address.
    pub addr: String,
    /// `public`, `random`, or anything else (treated as unknown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_type: Option<String>,
    /// Advertised service UUIDs.
    #[serde(default)]
    pub services: Vec<String>,
    /// Advertised local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Manufacturer company identifier (hex, e.g. `004c`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfg_company_id: Option<String>,
    /// Raw manufacturer payload as hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfg_data_raw: Option<String>,
    /// Received signal strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    /// Advertised TX power.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i64>,
    /// Which scanner saw it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_id: Option<String>,
    /// Scanner clock in milliseconds.
    #[serde(default)]
    pub ts_ms: i64,
}
