// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fingerprint derivation and device-id encoding.

use crate::norm::NormalizedObservation;
use sha2::{Digest, Sha256};

/// The fingerprints one observation yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    /// Hash of the stable advertisement material, when any exists.
    pub fp_stable: Option<String>,
    /// Hash of `addr + "/" + addr_type`; always present.
    pub fp_addr: String,
}

impl Fingerprints {
    /// Derive both fingerprints from a normalized observation.
    pub fn derive(norm: &NormalizedObservation) -> Self {
        let fp_stable = if norm.has_stable_material() {
            let material = format!(
                "{}{}{}{}",
                norm.services.join(","),
                norm.company_id.as_deref().unwrap_or(""),
                norm.mfg_masked.as_deref().unwrap_or(""),
                norm.name_norm.as_deref().unwrap_or(""),
            );
            Some(sha256_hex(material.as_bytes()))
        } else {
            None
        };

        let fp_addr = sha256_hex(format!("{}/{}", norm.addr, norm.addr_type.as_str()).as_bytes());

        Self { fp_stable, fp_addr }
    }

    /// The identity-bearing fingerprint: stable when it exists, else addr.
    pub fn primary(&self) -> &str {
        self.fp_stable.as_deref().unwrap_or(&self.fp_addr)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

const BASE32HEX: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Lowercase base32hex without padding.
fn base32hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32HEX[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32HEX[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Device id: `ble:` + first 26 base32hex characters of SHA-256 of the
/// primary fingerprint.
pub fn device_id_for(primary_fp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(primary_fp.as_bytes());
    let digest = hasher.finalize();
    let encoded = base32hex_encode(&digest);
    format!("ble:{}", &encoded[..26])
}
