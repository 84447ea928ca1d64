// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host snapshot assembly.
//!
//! Pure procfs/sysfs reads; every field is optional so the snapshot
//! degrades gracefully off Linux.

use serde::{Deserialize, Serialize};

/// What `snapshot.now` and heartbeat bursts report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Seconds since boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<f64>,
    /// 1/5/15-minute load averages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<[f64; 3]>,
    /// Total memory in KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_total_kb: Option<u64>,
    /// Available memory in KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_available_kb: Option<u64>,
    /// Mount points of real block devices.
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Network interface names.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl HostSnapshot {
    /// Assemble a snapshot from whatever the host exposes.
    pub fn collect() -> Self {
        Self {
            uptime_s: read_uptime(),
            load: read_loadavg(),
            mem_total_kb: read_meminfo("MemTotal"),
            mem_available_kb: read_meminfo("MemAvailable"),
            mounts: read_mounts(),
            interfaces: read_interfaces(),
        }
    }
}

fn read_uptime() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

fn read_loadavg() -> Option<[f64; 3]> {
    let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut parts = raw.split_whitespace();
    Some([
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
    ])
}

fn read_meminfo(field: &str) -> Option<u64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            let rest = rest.trim_start_matches(':').trim();
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn read_mounts() -> Vec<String> {
    let Ok(raw) = std::fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };
    raw.lines()
        .filter(|line| line.starts_with("/dev/"))
        .filter_map(|line| line.split_whitespace().nth(1).map(String::from))
        .collect()
}

fn read_interfaces() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
