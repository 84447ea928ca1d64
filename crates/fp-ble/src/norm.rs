// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observation normalization and manufacturer-data masking.

use crate::BleObservation;
use serde::{Deserialize, Serialize};

/// Normalized address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrType {
    /// Fixed public address.
    Public,
    /// Rotating random address.
    Random,
    /// Anything the scanner could not classify.
    Unknown,
}

impl AddrType {
    /// Parse a scanner-reported type string.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("public") => Self::Public,
            Some("random") => Self::Random,
            _ => Self::Unknown,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Random => "random",
            Self::Unknown => "unknown",
        }
    }
}

/// An observation after normalization, ready for fingerprinting.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedObservation {
    /// Lowercased address.
    pub addr: String,
    /// Normalized address type.
    pub addr_type: AddrType,
    /// Canonical services: trimmed, lowercased, unique, sorted.
    pub services: Vec<String>,
    /// Normalized name, when one was advertised.
    pub name_norm: Option<String>,
    /// Lowercased company id, when manufacturer data carried one.
    pub company_id: Option<String>,
    /// Masked manufacturer payload as hex.
    pub mfg_masked: Option<String>,
    /// Which scanner saw it.
    pub scanner_id: Option<String>,
    /// Scanner clock.
    pub ts_ms: i64,
}

impl NormalizedObservation {
    /// Normalize a raw observation.
    pub fn from_raw(obs: &BleObservation) -> Self {
        let company_id = obs
            .mfg_company_id
            .as_deref()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty());
        let mfg_bytes = obs
            .mfg_data_raw
            .as_deref()
            .and_then(|raw| hex::decode(raw.trim()).ok());
        let mfg_masked = mfg_bytes
            .as_deref()
            .map(|bytes| hex::encode(mask_mfg(company_id.as_deref(), bytes)));

        Self {
            addr: obs.addr.trim().to_ascii_lowercase(),
            addr_type: AddrType::parse(obs.addr_type.as_deref()),
            services: canon_services(&obs.services),
            name_norm: obs.name.as_deref().and_then(norm_name),
            company_id,
            mfg_masked,
            scanner_id: obs.scanner_id.clone(),
            ts_ms: obs.ts_ms,
        }
    }

    /// Whether any stable material exists (services ∪ company ∪ masked ∪ name).
    pub fn has_stable_material(&self) -> bool {
        !self.services.is_empty()
            || self.company_id.is_some()
            || self.mfg_masked.is_some()
            || self.name_norm.is_some()
    }
}

/// Canonicalize a service list: trimmed, lowercased, unique, sorted.
pub fn canon_services(services: &[String]) -> Vec<String> {
    let mut out: Vec<String> = services
        .iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Normalize an advertised name: lowercase, collapse whitespace, strip a
/// trailing `(N)` copy marker and a trailing `[-_ ]hex{4,}` serial suffix.
pub fn norm_name(raw: &str) -> Option<String> {
    let mut name = raw
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    name = strip_copy_marker(&name);
    name = strip_hex_suffix(&name);
    let name = name.trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

/// Strip a trailing `\s*\(\d+\)`.
fn strip_copy_marker(name: &str) -> String {
    if let Some(open) = name.rfind('(') {
        let tail = &name[open..];
        if tail.ends_with(')') && tail.len() > 2 {
            let inner = &tail[1..tail.len() - 1];
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                return name[..open].trim_end().to_string();
            }
        }
    }
    name.to_string()
}

/// Strip a trailing `[-_ ]hex{4,}`.
fn strip_hex_suffix(name: &str) -> String {
    if let Some(sep) = name.rfind(['-', '_', ' ']) {
        let suffix = &name[sep + 1..];
        if suffix.len() >= 4 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return name[..sep].trim_end().to_string();
        }
    }
    name.to_string()
}

/// Per-company boolean masks: `true` keeps the byte, `false` zeroes it.
/// Positions beyond the mask are volatile and zeroed.
fn company_mask(company_id: &str) -> Option<&'static [bool]> {
    match company_id {
        // Apple: type + subtype + stable prefix.
        "004c" => Some(&[true, true, true, true, true, true]),
        // Microsoft: scenario + version bytes.
        "0006" => Some(&[true, true, true, true]),
        _ => None,
    }
}

/// Apply the company mask to a manufacturer payload.
///
/// Unknown companies keep the first `min(4, len)` bytes.  Output length
/// equals input length; volatile bytes are zeroed, not dropped, so the
/// payload structure stays visible in the fingerprint.
pub fn mask_mfg(company_id: Option<&str>, bytes: &[u8]) -> Vec<u8> {
    let mask = company_id.and_then(company_mask);
    let keep_len = match mask {
        Some(mask) => mask.len(),
        None => 4.min(bytes.len()),
    };
    bytes
        .iter()
        .enumerate()
        .map(|(i, b)| match mask {
            Some(mask) if i < mask.len() => {
                if mask[i] { *b } else { 0 }
            }
            Some(_) => 0,
            None => {
                if i < keep_len { *b } else { 0 }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_type_parse() {
        assert_eq!(AddrType::parse(Some("Public")), AddrType::Public);
        assert_eq!(AddrType::parse(Some("random")), AddrType::Random);
        assert_eq!(AddrType::parse(Some("weird")), AddrType::Unknown);
        assert_eq!(AddrType::parse(None), AddrType::Unknown);
    }

    #[test]
    fn services_canonicalized() {
        let raw = vec![
            "  FE9F ".to_string(),
            "181a".to_string(),
            "fe9f".to_string(),
            String::new(),
        ];
        assert_eq!(canon_services(&raw), vec!["181a", "fe9f"]);
    }

    #[test]
    fn name_lowercase_and_collapse() {
        assert_eq!(norm_name("My  Beacon\tPro"), Some("my beacon pro".into()));
    }

    #[test]
    fn name_strips_copy_marker() {
        assert_eq!(norm_name("Speaker (2)"), Some("speaker".into()));
        assert_eq!(norm_name("Speaker(17)"), Some("speaker".into()));
        // Non-numeric parens stay.
        assert_eq!(norm_name("Speaker (left)"), Some("speaker (left)".into()));
    }

    #[test]
    fn name_strips_hex_serial_suffix() {
        assert_eq!(norm_name("tracker-a1b2c3"), Some("tracker".into()));
        assert_eq!(norm_name("tracker_DEAD"), Some("tracker".into()));
        assert_eq!(norm_name("tracker beef"), Some("tracker".into()));
        // Shorter than 4 hex chars is a word, not a serial.
        assert_eq!(norm_name("tracker ab"), Some("tracker ab".into()));
        // Non-hex suffix stays.
        assert_eq!(norm_name("tracker-zulu"), Some("tracker-zulu".into()));
    }

    #[test]
    fn name_empty_after_normalization() {
        assert_eq!(norm_name("   "), None);
        assert_eq!(norm_name("(3)"), None);
    }

    #[test]
    fn apple_mask_keeps_six_bytes() {
        let bytes: Vec<u8> = (1..=10).collect();
        let masked = mask_mfg(Some("004c"), &bytes);
        assert_eq!(masked, vec![1, 2, 3, 4, 5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn microsoft_mask_keeps_four_bytes() {
        let bytes: Vec<u8> = (1..=6).collect();
        assert_eq!(mask_mfg(Some("0006"), &bytes), vec![1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn unknown_company_keeps_min_four() {
        let bytes: Vec<u8> = (1..=8).collect();
        assert_eq!(mask_mfg(Some("ffff"), &bytes), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(mask_mfg(None, &[9, 9]), vec![9, 9]);
    }

    #[test]
    fn normalization_end_to_end() {
        let obs = BleObservation {
            addr: "AA:BB:CC:DD:EE:FF".into(),
            addr_type: Some("RANDOM".into()),
            services: vec!["FE9F".into(), "fe9f".into()],
            name: Some("AirTag-C0FFEE".into()),
            mfg_company_id: Some("004C".into()),
            mfg_data_raw: Some("1219aabbccdd0102".into()),
            ts_ms: 1,
            ..Default::default()
        };
        let n = NormalizedObservation::from_raw(&obs);
        assert_eq!(n.addr, "aa:bb:cc:dd:ee:ff");
        assert_eq!(n.addr_type, AddrType::Random);
        assert_eq!(n.services, vec!["fe9f"]);
        assert_eq!(n.name_norm, Some("airtag".into()));
        assert_eq!(n.company_id, Some("004c".into()));
        assert_eq!(n.mfg_masked, Some("1219aabbccdd0000".into()));
        assert!(n.has_stable_material());
    }

    #[test]
    fn no_stable_material() {
        let obs = BleObservation {
            addr: "aa:bb:cc:dd:ee:ff".into(),
            ..Default::default()
        };
        let n = NormalizedObservation::from_raw(&obs);
        assert!(!n.has_stable_material());
    }
}
