// SPDX-License-Identifier: MIT OR Apache-2.0
//! Where the feed reads events from: the local filesystem, a plain
//! remote over ssh, or a remote behind the constrained executor.
//!
//! Transient remote failures (ssh exit 255, timeouts, resets) are
//! retried with a small bounded backoff; malformed lines are counted by
//! the scanner and never fatal.

use chrono::NaiveDate;
use fp_store::{DayScan, EventStore, SEGMENT_FILE, scan_lines};
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Remote call budget per attempt.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts per remote call.
const REMOTE_ATTEMPTS: u32 = 3;
/// First backoff; doubles per retry.
const REMOTE_BACKOFF: Duration = Duration::from_millis(200);

/// Feed read errors.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Local store failure.
    #[error("store: {0}")]
    Store(#[from] fp_store::StoreError),
    /// Remote call kept failing after retries.
    #[error("remote: {0}")]
    Remote(String),
    /// The guard refused or answered garbage.
    #[error("guard: {0}")]
    Guard(String),
}

/// A resolved event source.
pub enum EventSource {
    /// Direct filesystem access.
    Local(EventStore),
    /// Plain remote: `ssh <host> tail/ls`.
    Ssh {
        /// Remote host (user@host form accepted).
        host: String,
        /// Store root on the remote.
        root: PathBuf,
    },
    /// Remote through the constrained executor.
    SshGuard {
        /// Remote host.
        host: String,
        /// Store root on the remote.
        root: PathBuf,
        /// Guard binary invoked on the remote.
        guard_cmd: String,
    },
}

impl EventSource {
    /// Days present, oldest first.
    pub async fn list_days(&self) -> Result<Vec<NaiveDate>, FeedError> {
        match self {
            Self::Local(store) => Ok(store.list_days()?),
            Self::Ssh { host, root } => {
                let listing = retrying_ssh(
                    host,
                    &["ls".to_string(), format!("{}/events", root.display())],
                    None,
                )
                .await?;
                Ok(parse_day_listing(&listing))
            }
            Self::SshGuard {
                host,
                root,
                guard_cmd,
            } => {
                let request = json!({
                    "cmd": "/bin/ls",
                    "args": [format!("{}/events", root.display())],
                    "cwd": "/",
                });
                let listing = retrying_guard(host, guard_cmd, &request).await?;
                Ok(parse_day_listing(&listing))
            }
        }
    }

    /// Last `max_lines` of one day's segment, parsed.
    pub async fn tail_day(&self, date: NaiveDate, max_lines: usize) -> Result<DayScan, FeedError> {
        match self {
            Self::Local(store) => {
                let mut scan = store.read_day(date)?;
                if scan.events.len() > max_lines {
                    scan.events = scan.events.split_off(scan.events.len() - max_lines);
                }
                Ok(scan)
            }
            Self::Ssh { host, root } => {
                let path = segment_path(root, date);
                let raw = retrying_ssh(
                    host,
                    &[
                        "tail".to_string(),
                        "-n".to_string(),
                        max_lines.to_string(),
                        path,
                    ],
                    None,
                )
                .await?;
                Ok(scan_lines(raw.lines()))
            }
            Self::SshGuard {
                host,
                root,
                guard_cmd,
            } => {
                let request = json!({
                    "cmd": "/usr/bin/tail",
                    "args": ["-n", max_lines.to_string(), segment_path(root, date)],
                    "cwd": "/",
                });
                let raw = retrying_guard(host, guard_cmd, &request).await?;
                Ok(scan_lines(raw.lines()))
            }
        }
    }
}

fn segment_path(root: &PathBuf, date: NaiveDate) -> String {
    format!(
        "{}/events/{}/{}",
        root.display(),
        date.format("%Y-%m-%d"),
        SEGMENT_FILE
    )
}

/// Parse an `ls` of the events directory into dates.
pub fn parse_day_listing(raw: &str) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = raw
        .lines()
        .filter_map(|line| NaiveDate::parse_from_str(line.trim(), "%Y-%m-%d").ok())
        .collect();
    days.sort();
    days
}

/// Whether a failed remote attempt is worth retrying.
pub fn is_transient(exit_code: Option<i32>, timed_out: bool) -> bool {
    // 255 is ssh's own "connection problem"; a timeout or signal death
    // reads the same way.  Real remote-command failures come back with
    // ordinary exit codes and are terminal.
    timed_out || exit_code == Some(255) || exit_code.is_none()
}

async fn run_remote(
    program: &str,
    args: &[String],
    stdin_body: Option<&[u8]>,
) -> Result<(Option<i32>, bool, String), FeedError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(if stdin_body.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| FeedError::Remote(format!("spawn {program}: {e}")))?;
    if let Some(body) = stdin_body {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(body).await;
            let _ = stdin.shutdown().await;
        }
    }

    match tokio::time::timeout(REMOTE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok((
            output.status.code(),
            false,
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )),
        Ok(Err(e)) => Err(FeedError::Remote(format!("wait {program}: {e}"))),
        Err(_) => Ok((None, true, String::new())),
    }
}

async fn retrying_ssh(
    host: &str,
    remote_argv: &[String],
    stdin_body: Option<&[u8]>,
) -> Result<String, FeedError> {
    let mut args: Vec<String> = vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "ConnectTimeout=5".into(),
        host.to_string(),
        "--".into(),
    ];
    args.extend(remote_argv.iter().cloned());

    let mut backoff = REMOTE_BACKOFF;
    let mut last = String::from("no attempts made");
    for attempt in 0..REMOTE_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        match run_remote("ssh", &args, stdin_body).await {
            Ok((Some(0), false, stdout)) => return Ok(stdout),
            Ok((code, timed_out, _)) if is_transient(code, timed_out) => {
                warn!(host, attempt, ?code, timed_out, "transient ssh failure");
                last = format!("exit {code:?}, timed_out {timed_out}");
            }
            Ok((code, _, _)) => {
                debug!(host, ?code, "remote command failed");
                return Err(FeedError::Remote(format!("remote exit {code:?}")));
            }
            Err(err) => return Err(err),
        }
    }
    Err(FeedError::Remote(format!("retries exhausted: {last}")))
}

async fn retrying_guard(
    host: &str,
    guard_cmd: &str,
    request: &serde_json::Value,
) -> Result<String, FeedError> {
    let body = serde_json::to_vec(request)
        .map_err(|e| FeedError::Guard(format!("request encode: {e}")))?;
    let raw = retrying_ssh(host, &[guard_cmd.to_string()], Some(&body)).await?;
    // The guard prints one JSON response; stdout of the guarded command
    // rides inside it.
    let response: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|e| FeedError::Guard(format!("response: {e}")))?;
    if response.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
        return Err(FeedError::Guard(format!(
            "denied: {}",
            response
                .get("denied_code")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
        )));
    }
    Ok(response
        .get("stdout")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_listing_parses_and_sorts() {
        let days = parse_day_listing("2026-08-01\ngarbage\n2026-07-30\n\n2026-07-31\n");
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].to_string(), "2026-07-30");
        assert_eq!(days[2].to_string(), "2026-08-01");
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(Some(255), false));
        assert!(is_transient(None, true));
        assert!(is_transient(None, false));
        assert!(!is_transient(Some(1), false));
        assert!(!is_transient(Some(0), false));
    }

    #[tokio::test]
    async fn local_tail_caps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        for i in 0..10 {
            store
                .append(&fp_core::Envelope::new("t.seq", "n", json!({"i": i})))
                .await
                .unwrap();
        }
        let source = EventSource::Local(EventStore::new(dir.path()));
        let today = chrono::Utc::now().date_naive();
        let scan = source.tail_day(today, 3).await.unwrap();
        assert_eq!(scan.events.len(), 3);
        assert_eq!(scan.events[0].data["i"], json!(7));
    }
}
