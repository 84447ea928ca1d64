// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only per-day NDJSON event store.
//!
//! One JSON object per line under `<root>/events/YYYY-MM-DD/ingest.ndjson`,
//! UTC dated.  Records are immutable once appended.  A single in-process
//! mutex serializes appends; multiple writer processes are not supported.
//! Partial lines are the reader's problem: they are counted and skipped,
//! never deleted.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{NaiveDate, Utc};
use fp_core::Envelope;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// File name of the per-day segment.
pub const SEGMENT_FILE: &str = "ingest.ndjson";

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure underneath the store.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// An envelope refused to serialize (should not happen for valid JSON data).
    #[error("store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

struct OpenDay {
    date: NaiveDate,
    file: std::fs::File,
}

/// The append side of the store.
///
/// Appends flush per record so a crash loses at most the record being
/// written; fsync happens on day rotation and on [`EventStore::sync`], not
/// per append.
pub struct EventStore {
    root: PathBuf,
    open: Mutex<Option<OpenDay>>,
}

impl EventStore {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(None),
        }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subdirectory per UTC day.
    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    /// Path of the segment for `date`.
    pub fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.events_dir()
            .join(date.format("%Y-%m-%d").to_string())
            .join(SEGMENT_FILE)
    }

    /// Append one envelope; returns the path it landed in.
    pub async fn append(&self, env: &Envelope) -> Result<PathBuf, StoreError> {
        let mut line = serde_json::to_vec(env)?;
        line.push(b'\n');

        let today = Utc::now().date_naive();
        let path = self.day_path(today);

        let mut guard = self.open.lock().await;
        let rotate = match guard.as_ref() {
            Some(open) => open.date != today,
            None => true,
        };
        if rotate {
            if let Some(prev) = guard.take() {
                // fsync on close only.
                if let Err(err) = prev.file.sync_all() {
                    warn!(error = %err, "fsync on day rotation failed");
                }
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            debug!(path = %path.display(), "opened day segment");
            *guard = Some(OpenDay { date: today, file });
        }

        let open = guard.as_mut().expect("day segment open");
        open.file.write_all(&line)?;
        open.file.flush()?;
        Ok(path)
    }

    /// Flush and fsync the open segment, if any.
    pub async fn sync(&self) -> Result<(), StoreError> {
        if let Some(open) = self.open.lock().await.as_mut() {
            open.file.flush()?;
            open.file.sync_all()?;
        }
        Ok(())
    }

    /// UTC days present in the store, oldest first.
    pub fn list_days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let dir = self.events_dir();
        let mut days = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(days),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(date) = name
                .to_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            {
                days.push(date);
            }
        }
        days.sort();
        Ok(days)
    }

    /// Read one day's segment.
    pub fn read_day(&self, date: NaiveDate) -> Result<DayScan, StoreError> {
        scan_segment(&self.day_path(date))
    }

    /// Newest events across recent days, up to `max_lines` raw lines.
    ///
    /// Scans backwards from the newest day until the line budget is spent.
    /// Returned events are in file order (oldest first within the window).
    pub fn tail(&self, max_lines: usize) -> Result<DayScan, StoreError> {
        let mut days = self.list_days()?;
        days.reverse();

        let mut window: Vec<Envelope> = Vec::new();
        let mut malformed = 0usize;
        let mut budget = max_lines;
        for day in days {
            if budget == 0 {
                break;
            }
            let scan = self.read_day(day)?;
            malformed += scan.malformed_lines_skipped;
            let take = scan.events.len().min(budget);
            let start = scan.events.len() - take;
            // Prepend so older days land before newer ones.
            let mut chunk = scan.events[start..].to_vec();
            chunk.append(&mut window);
            window = chunk;
            budget -= take;
        }
        Ok(DayScan {
            events: window,
            malformed_lines_skipped: malformed,
        })
    }
}

/// Result of scanning a segment: parsed envelopes plus the count of lines
/// that did not parse (partial writes, corruption).
#[derive(Debug, Default, Clone)]
pub struct DayScan {
    /// Envelopes in file order.
    pub events: Vec<Envelope>,
    /// Lines that failed JSON parse or field validation; skipped, never deleted.
    pub malformed_lines_skipped: usize,
}

/// Scan one NDJSON segment file.
pub fn scan_segment(path: &Path) -> Result<DayScan, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(DayScan::default()),
        Err(err) => return Err(err.into()),
    };
    Ok(scan_lines(raw.lines()))
}

/// Parse an iterator of NDJSON lines, counting malformed ones.
pub fn scan_lines<'a>(lines: impl Iterator<Item = &'a str>) -> DayScan {
    let mut scan = DayScan::default();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => match Envelope::from_value(&value) {
                Ok(env) => scan.events.push(env),
                Err(_) => scan.malformed_lines_skipped += 1,
            },
            Err(_) => scan.malformed_lines_skipped += 1,
        }
    }
    scan
}

// ---------------------------------------------------------------------------
// Channel-fed writer task
// ---------------------------------------------------------------------------

/// Cloneable handle feeding the single writer task.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Envelope>,
}

impl StoreHandle {
    /// Enqueue an envelope for append; waits when the channel is full.
    pub async fn send(&self, env: Envelope) -> Result<(), StoreError> {
        self.tx
            .send(env)
            .await
            .map_err(|_| StoreError::Io(std::io::Error::other("store writer gone")))
    }
}

/// Spawn the owning writer task over a bounded channel with backpressure.
///
/// One task owns the file; every other task sends envelopes to it.  The
/// task drains until all handles drop, then fsyncs.
pub fn spawn_writer(
    store: std::sync::Arc<EventStore>,
    capacity: usize,
) -> (StoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            if let Err(err) = store.append(&env).await {
                warn!(error = %err, kind = %env.kind, "append failed; event dropped");
            }
        }
        if let Err(err) = store.sync().await {
            warn!(error = %err, "final sync failed");
        }
    });
    (StoreHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn append_lands_under_utc_day() {
        let (_dir, store) = store();
        let env = Envelope::new("test.event", "n1", json!({"k": 1}));
        let path = store.append(&env).await.unwrap();
        assert!(path.ends_with(
            PathBuf::from(Utc::now().date_naive().format("%Y-%m-%d").to_string())
                .join(SEGMENT_FILE)
        ));
        let scan = store.read_day(Utc::now().date_naive()).unwrap();
        assert_eq!(scan.events.len(), 1);
        assert_eq!(scan.events[0].kind, "test.event");
        assert_eq!(scan.malformed_lines_skipped, 0);
    }

    #[tokio::test]
    async fn appends_are_one_line_each() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .append(&Envelope::new("test.seq", "n1", json!({"i": i})))
                .await
                .unwrap();
        }
        let raw = std::fs::read_to_string(store.day_path(Utc::now().date_naive())).unwrap();
        assert_eq!(raw.lines().count(), 5);
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn malformed_lines_are_counted_and_skipped() {
        let (_dir, store) = store();
        store
            .append(&Envelope::new("test.good", "n1", json!({})))
            .await
            .unwrap();
        let path = store.day_path(Utc::now().date_naive());
        // Simulate a torn write and a record missing required fields.
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"type\":\"test.torn\",\"src\":\"n1\",\"ts\n");
        raw.push_str("{\"type\":\"test.incomplete\",\"src\":\"n1\"}\n");
        std::fs::write(&path, raw).unwrap();

        store
            .append(&Envelope::new("test.after", "n1", json!({})))
            .await
            .unwrap();
        let scan = store.read_day(Utc::now().date_naive()).unwrap();
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.malformed_lines_skipped, 2);
    }

    #[tokio::test]
    async fn list_days_empty_when_no_events() {
        let (_dir, store) = store();
        assert!(store.list_days().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tail_respects_line_budget() {
        let (_dir, store) = store();
        for i in 0..10 {
            store
                .append(&Envelope::new("test.seq", "n1", json!({"i": i})))
                .await
                .unwrap();
        }
        let scan = store.tail(4).unwrap();
        assert_eq!(scan.events.len(), 4);
        assert_eq!(scan.events.last().unwrap().data["i"], json!(9));
        assert_eq!(scan.events.first().unwrap().data["i"], json!(6));
    }

    #[tokio::test]
    async fn writer_task_drains_all_producers() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let (handle, join) = spawn_writer(store.clone(), 8);

        let mut tasks = Vec::new();
        for t in 0..4 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    h.send(Envelope::new("test.fanin", "n1", json!({"t": t, "i": i})))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(handle);
        join.await.unwrap();

        let scan = store.read_day(Utc::now().date_naive()).unwrap();
        assert_eq!(scan.events.len(), 100);
    }
}
