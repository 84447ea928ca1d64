// SPDX-License-Identifier: MIT OR Apache-2.0
//! The persistent device registry.
//!
//! Single-writer SQLite: one process owns the database; concurrent
//! writers must serialize externally and retry on busy (a 5-second busy
//! timeout is set on open).  All registry state lives in three tables so
//! the fingerprint graph survives restarts; the merge-window signal map
//! is in-memory only, matching its 5-second horizon.

use crate::fingerprint::{Fingerprints, device_id_for};
use crate::norm::{AddrType, NormalizedObservation};
use crate::BleObservation;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Two observations under the same signal key within this window merge
/// their devices.
pub const MERGE_WINDOW_MS: i64 = 5_000;

/// Attach outright at or above this score.
pub const CONFIDENT_SCORE: i32 = 70;
/// Attach as a weak candidate at or above this score.
pub const CANDIDATE_SCORE: i32 = 50;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// SQLite failure.
    #[error("registry db: {0}")]
    Db(#[from] rusqlite::Error),
    /// Stored meta JSON failed to decode.
    #[error("registry meta decode: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Mutable descriptive state of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeta {
    /// Union of canonical services ever advertised.
    #[serde(default)]
    pub services: BTreeSet<String>,
    /// Last normalized name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_norm: Option<String>,
    /// Manufacturer company id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// Masked manufacturer payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfg_masked: Option<String>,
    /// Every address ever seen.
    #[serde(default)]
    pub addr_set: BTreeSet<String>,
    /// Public addresses only.
    #[serde(default)]
    pub addr_public_set: BTreeSet<String>,
    /// Scanners that have reported this device.
    #[serde(default)]
    pub scanners: BTreeSet<String>,
    /// Resolution confidence, 0–99.
    #[serde(default)]
    pub confidence: i32,
    /// Whether the last attach was a weak (candidate) match.
    #[serde(default)]
    pub candidate: bool,
    /// Stable fingerprint, once any observation carried stable material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp_stable: Option<String>,
    /// Address fingerprint of the last observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp_addr: Option<String>,
    /// Last seen address.
    #[serde(default)]
    pub last_addr: String,
    /// Last seen address type.
    #[serde(default)]
    pub last_addr_type: String,
}

/// One persistent device row.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// `ble:`-prefixed identity.
    pub device_id: String,
    /// The fingerprint the id was derived from.
    pub primary_fp: String,
    /// First-seen timestamp.
    pub created_ts: i64,
    /// Last-seen timestamp.
    pub last_seen_ts: i64,
    /// Descriptive state.
    pub meta: DeviceMeta,
}

/// Per-observation resolution event (`ble.device.seen`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenEvent {
    /// Resolved device.
    pub device_id: String,
    /// Confidence after this observation.
    pub confidence: i32,
    /// Whether the attach was a weak match.
    pub candidate: bool,
    /// Stable fingerprint, when the observation had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp_stable: Option<String>,
    /// Address fingerprint.
    pub fp_addr: String,
}

/// Two devices collapsed into one (`ble.device.merged`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEvent {
    /// The deleted device.
    pub from: String,
    /// The surviving device.
    pub to: String,
    /// Which signal key triggered the merge.
    pub reason: String,
}

/// What one observation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserveOutcome {
    /// Always emitted.
    pub seen: SeenEvent,
    /// Emitted when the merge window collapsed two devices.
    pub merged: Option<MergedEvent>,
}

struct SignalEntry {
    device_id: String,
    ts_ms: i64,
}

/// The registry handle.  Interior mutability: one mutex over the
/// connection, one over the signal map.
pub struct BleRegistry {
    conn: Mutex<Connection>,
    signals: Mutex<HashMap<String, SignalEntry>>,
}

impl BleRegistry {
    /// Open (or create) the registry at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// An in-memory registry (tests, ephemeral nodes).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ble_devices (
                device_id    TEXT PRIMARY KEY,
                primary_fp   TEXT NOT NULL,
                created_ts   INTEGER NOT NULL,
                last_seen_ts INTEGER NOT NULL,
                meta_json    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ble_fps (
                fp         TEXT PRIMARY KEY,
                device_id  TEXT NOT NULL,
                kind       TEXT NOT NULL,
                created_ts INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ble_fps_device ON ble_fps(device_id);
            CREATE TABLE IF NOT EXISTS ble_aliases (
                device_id       TEXT PRIMARY KEY,
                addr_last       TEXT,
                name_last       TEXT,
                company_id_last TEXT,
                updated_ts      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ble_aliases_addr ON ble_aliases(addr_last);",
        )?;
        info!("ble registry ready");
        Ok(Self {
            conn: Mutex::new(conn),
            signals: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live devices.
    pub fn device_count(&self) -> Result<i64, RegistryError> {
        let conn = self.conn.lock().expect("registry poisoned");
        Ok(conn.query_row("SELECT COUNT(*) FROM ble_devices", [], |r| r.get(0))?)
    }

    /// Resolve a fingerprint to its device id, if mapped.
    pub fn device_for_fp(&self, fp: &str) -> Result<Option<String>, RegistryError> {
        let conn = self.conn.lock().expect("registry poisoned");
        Ok(conn
            .query_row(
                "SELECT device_id FROM ble_fps WHERE fp = ?1",
                params![fp],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Load a device by id.
    pub fn device(&self, device_id: &str) -> Result<Option<Device>, RegistryError> {
        let conn = self.conn.lock().expect("registry poisoned");
        load_device(&conn, device_id)
    }

    /// Process one observation end to end.
    pub fn observe(&self, obs: &BleObservation) -> Result<ObserveOutcome, RegistryError> {
        let norm = NormalizedObservation::from_raw(obs);
        let fps = Fingerprints::derive(&norm);

        let mut conn = self.conn.lock().expect("registry poisoned");
        let tx = conn.transaction()?;

        let candidates = collect_candidates(&tx, &fps, &norm)?;
        let scored_best = candidates
            .into_iter()
            .map(|dev| {
                let score = score_candidate(&dev.meta, &norm, &fps);
                (score, dev)
            })
            .max_by_key(|(score, _)| *score);

        let (mut device, candidate_attach, fresh) = match scored_best {
            Some((score, dev)) if score >= CONFIDENT_SCORE => (dev, false, false),
            Some((score, dev)) if score >= CANDIDATE_SCORE => (dev, true, false),
            _ => {
                let primary = fps.primary().to_string();
                let device_id = device_id_for(&primary);
                match load_device(&tx, &device_id)? {
                    // The derived id already exists: attach instead of
                    // recreating (never resurrect by overwrite).
                    Some(existing) => (existing, false, false),
                    None => {
                        let confidence = if fps.fp_stable.is_some() { 62 } else { 35 };
                        let dev = Device {
                            device_id,
                            primary_fp: primary,
                            created_ts: norm.ts_ms,
                            last_seen_ts: norm.ts_ms,
                            meta: DeviceMeta {
                                confidence,
                                ..DeviceMeta::default()
                            },
                        };
                        debug!(device_id = %dev.device_id, confidence, "new ble device");
                        (dev, false, true)
                    }
                }
            }
        };

        apply_observation(&mut device, &norm, &fps, candidate_attach, fresh);
        upsert_device(&tx, &device)?;
        upsert_fp(&tx, &fps.fp_addr, &device.device_id, "addr", norm.ts_ms)?;
        if let Some(fp_stable) = &fps.fp_stable {
            upsert_fp(&tx, fp_stable, &device.device_id, "stable", norm.ts_ms)?;
        }
        upsert_alias(&tx, &device, norm.ts_ms)?;

        // Merge window: same signal key, different device, within 5 s.
        let mut merged = None;
        for key in signal_keys(&fps, &norm) {
            let prior = {
                let signals = self.signals.lock().expect("signals poisoned");
                signals
                    .get(&key)
                    .filter(|e| norm.ts_ms - e.ts_ms <= MERGE_WINDOW_MS)
                    .filter(|e| e.device_id != device.device_id)
                    .map(|e| e.device_id.clone())
            };
            if let (Some(other_id), None) = (prior, merged.as_ref()) {
                if let Some(event) =
                    merge_devices(&tx, &other_id, &device.device_id, &key)?
                {
                    // The surviving id is what later lookups must resolve to.
                    if event.to != device.device_id {
                        if let Some(winner) = load_device(&tx, &event.to)? {
                            device = winner;
                        }
                    }
                    merged = Some(event);
                }
            }
            let mut signals = self.signals.lock().expect("signals poisoned");
            signals.insert(
                key,
                SignalEntry {
                    device_id: device.device_id.clone(),
                    ts_ms: norm.ts_ms,
                },
            );
        }

        // Opportunistic GC of stale signal entries.
        {
            let mut signals = self.signals.lock().expect("signals poisoned");
            signals.retain(|_, e| norm.ts_ms - e.ts_ms <= MERGE_WINDOW_MS);
        }

        tx.commit()?;

        Ok(ObserveOutcome {
            seen: SeenEvent {
                device_id: device.device_id.clone(),
                confidence: device.meta.confidence,
                candidate: device.meta.candidate,
                fp_stable: fps.fp_stable.clone(),
                fp_addr: fps.fp_addr.clone(),
            },
            merged,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Score a candidate device against a fresh observation.
pub fn score_candidate(
    meta: &DeviceMeta,
    norm: &NormalizedObservation,
    fps: &Fingerprints,
) -> i32 {
    let mut score = 0;

    if let (Some(fp), Some(have)) = (&fps.fp_stable, &meta.fp_stable) {
        if fp == have {
            score += 60;
        }
    }

    if !norm.services.is_empty() && !meta.services.is_empty() {
        let overlap = norm
            .services
            .iter()
            .filter(|s| meta.services.contains(*s))
            .count();
        let denom = norm.services.len().max(meta.services.len());
        let ratio = overlap as f64 / denom as f64;
        if overlap == 0 {
            score -= 40;
        } else if ratio >= 0.5 {
            score += 25;
        }
    }

    if let (Some(company), Some(have)) = (&norm.company_id, &meta.company_id) {
        if company == have {
            if norm.mfg_masked.is_some() && norm.mfg_masked == meta.mfg_masked {
                score += 20;
            }
        } else {
            score -= 30;
        }
    }

    if norm.name_norm.is_some() && norm.name_norm == meta.name_norm {
        score += 10;
    }

    if norm.addr_type == AddrType::Public && meta.addr_public_set.contains(&norm.addr) {
        score += 10;
    }

    score
}

fn signal_keys(fps: &Fingerprints, norm: &NormalizedObservation) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(fp) = &fps.fp_stable {
        keys.push(format!("stable:{fp}"));
    }
    if let (Some(company), Some(masked)) = (&norm.company_id, &norm.mfg_masked) {
        keys.push(format!("mfg:{company}:{masked}"));
    }
    keys
}

fn apply_observation(
    device: &mut Device,
    norm: &NormalizedObservation,
    fps: &Fingerprints,
    candidate_attach: bool,
    fresh: bool,
) {
    let meta = &mut device.meta;
    for s in &norm.services {
        meta.services.insert(s.clone());
    }
    if norm.name_norm.is_some() {
        meta.name_norm = norm.name_norm.clone();
    }
    if norm.company_id.is_some() {
        meta.company_id = norm.company_id.clone();
    }
    if norm.mfg_masked.is_some() {
        meta.mfg_masked = norm.mfg_masked.clone();
    }
    meta.addr_set.insert(norm.addr.clone());
    if norm.addr_type == AddrType::Public {
        meta.addr_public_set.insert(norm.addr.clone());
    }
    if let Some(scanner) = &norm.scanner_id {
        meta.scanners.insert(scanner.clone());
    }
    if let Some(fp_stable) = &fps.fp_stable {
        if meta.fp_stable.is_none() {
            meta.fp_stable = Some(fp_stable.clone());
        }
    }
    meta.fp_addr = Some(fps.fp_addr.clone());
    meta.last_addr = norm.addr.clone();
    meta.last_addr_type = norm.addr_type.as_str().to_string();
    meta.candidate = candidate_attach;
    if !fresh {
        // Confidence climbs with corroboration, capped below certainty.
        meta.confidence = (meta.confidence + if candidate_attach { 2 } else { 5 }).min(99);
    }
    device.last_seen_ts = norm.ts_ms.max(device.last_seen_ts);
}

// ---------------------------------------------------------------------------
// Persistence helpers (called under the open transaction)
// ---------------------------------------------------------------------------

fn load_device(conn: &Connection, device_id: &str) -> Result<Option<Device>, RegistryError> {
    let row = conn
        .query_row(
            "SELECT device_id, primary_fp, created_ts, last_seen_ts, meta_json
             FROM ble_devices WHERE device_id = ?1",
            params![device_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((device_id, primary_fp, created_ts, last_seen_ts, meta_json)) => Ok(Some(Device {
            device_id,
            primary_fp,
            created_ts,
            last_seen_ts,
            meta: serde_json::from_str(&meta_json)?,
        })),
    }
}

fn collect_candidates(
    conn: &Connection,
    fps: &Fingerprints,
    norm: &NormalizedObservation,
) -> Result<Vec<Device>, RegistryError> {
    let mut ids: Vec<String> = Vec::new();

    let push_fp = |conn: &Connection, fp: &str, ids: &mut Vec<String>| -> Result<(), RegistryError> {
        let id: Option<String> = conn
            .query_row(
                "SELECT device_id FROM ble_fps WHERE fp = ?1",
                params![fp],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(())
    };

    if let Some(fp) = &fps.fp_stable {
        push_fp(conn, fp, &mut ids)?;
    }
    push_fp(conn, &fps.fp_addr, &mut ids)?;

    if let Some(company) = &norm.company_id {
        let mut stmt = conn.prepare(
            "SELECT device_id FROM ble_aliases WHERE company_id_last = ?1
             ORDER BY updated_ts DESC LIMIT 25",
        )?;
        let rows = stmt.query_map(params![company], |r| r.get::<_, String>(0))?;
        for row in rows {
            let id = row?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    let mut devices = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(dev) = load_device(conn, &id)? {
            devices.push(dev);
        }
    }
    Ok(devices)
}

fn upsert_device(conn: &Connection, device: &Device) -> Result<(), RegistryError> {
    conn.execute(
        "INSERT INTO ble_devices (device_id, primary_fp, created_ts, last_seen_ts, meta_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(device_id) DO UPDATE SET
            primary_fp = excluded.primary_fp,
            last_seen_ts = excluded.last_seen_ts,
            meta_json = excluded.meta_json",
        params![
            device.device_id,
            device.primary_fp,
            device.created_ts,
            device.last_seen_ts,
            serde_json::to_string(&device.meta)?,
        ],
    )?;
    Ok(())
}

fn upsert_fp(
    conn: &Connection,
    fp: &str,
    device_id: &str,
    kind: &str,
    ts_ms: i64,
) -> Result<(), RegistryError> {
    conn.execute(
        "INSERT INTO ble_fps (fp, device_id, kind, created_ts)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(fp) DO UPDATE SET device_id = excluded.device_id",
        params![fp, device_id, kind, ts_ms],
    )?;
    Ok(())
}

fn upsert_alias(conn: &Connection, device: &Device, ts_ms: i64) -> Result<(), RegistryError> {
    conn.execute(
        "INSERT INTO ble_aliases (device_id, addr_last, name_last, company_id_last, updated_ts)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(device_id) DO UPDATE SET
            addr_last = excluded.addr_last,
            name_last = excluded.name_last,
            company_id_last = excluded.company_id_last,
            updated_ts = excluded.updated_ts",
        params![
            device.device_id,
            device.meta.last_addr,
            device.meta.name_norm,
            device.meta.company_id,
            ts_ms,
        ],
    )?;
    Ok(())
}

/// Merge two devices: the one with the older `created_ts` survives.
///
/// The loser's fingerprints, services, address sets, and scanner lists
/// fold into the winner; every fingerprint row is rewritten; the loser is
/// deleted.  Returns `None` when either side no longer exists.
fn merge_devices(
    conn: &Connection,
    a_id: &str,
    b_id: &str,
    signal_key: &str,
) -> Result<Option<MergedEvent>, RegistryError> {
    let a = match load_device(conn, a_id)? {
        Some(d) => d,
        None => return Ok(None),
    };
    let b = match load_device(conn, b_id)? {
        Some(d) => d,
        None => return Ok(None),
    };

    let (mut winner, loser) = if a.created_ts <= b.created_ts { (a, b) } else { (b, a) };

    winner.meta.services.extend(loser.meta.services.iter().cloned());
    winner.meta.addr_set.extend(loser.meta.addr_set.iter().cloned());
    winner
        .meta
        .addr_public_set
        .extend(loser.meta.addr_public_set.iter().cloned());
    winner.meta.scanners.extend(loser.meta.scanners.iter().cloned());
    if winner.meta.fp_stable.is_none() {
        winner.meta.fp_stable = loser.meta.fp_stable.clone();
    }
    if winner.meta.name_norm.is_none() {
        winner.meta.name_norm = loser.meta.name_norm.clone();
    }
    if winner.meta.company_id.is_none() {
        winner.meta.company_id = loser.meta.company_id.clone();
    }
    if winner.meta.mfg_masked.is_none() {
        winner.meta.mfg_masked = loser.meta.mfg_masked.clone();
    }
    if loser.last_seen_ts > winner.last_seen_ts {
        winner.last_seen_ts = loser.last_seen_ts;
        winner.meta.last_addr = loser.meta.last_addr.clone();
        winner.meta.last_addr_type = loser.meta.last_addr_type.clone();
    }
    winner.meta.confidence = winner.meta.confidence.max(loser.meta.confidence);
    winner.meta.candidate = false;

    conn.execute(
        "UPDATE ble_fps SET device_id = ?1 WHERE device_id = ?2",
        params![winner.device_id, loser.device_id],
    )?;
    conn.execute(
        "DELETE FROM ble_devices WHERE device_id = ?1",
        params![loser.device_id],
    )?;
    conn.execute(
        "DELETE FROM ble_aliases WHERE device_id = ?1",
        params![loser.device_id],
    )?;
    upsert_device(conn, &winner)?;
    upsert_alias(conn, &winner, winner.last_seen_ts)?;

    info!(from = %loser.device_id, to = %winner.device_id, key = signal_key, "merged ble devices");
    Ok(Some(MergedEvent {
        from: loser.device_id,
        to: winner.device_id,
        reason: format!("merge-window:{signal_key}"),
    }))
}
