// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded child-process runner.
//!
//! Commands are spawned without a shell from a strictly-typed
//! [`CommandSpec`].  Stdout and stderr are piped and capped at 256 KiB
//! each; the digests cover the full stream so truncation never hides
//! output from the audit trail.  A per-run deadline kills the child with
//! SIGKILL and the result still carries `timed_out: true`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fp_policy::CommandSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Exact cap applied to each captured stream.
pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// Default per-run deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a finished (or killed) run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Exit code when the child exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, when there was one.
    pub signal: Option<i32>,
    /// Whether the deadline expired and the child was killed.
    pub timed_out: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Stdout, truncated to [`MAX_CAPTURE_BYTES`].
    pub stdout: String,
    /// Stderr, truncated to [`MAX_CAPTURE_BYTES`].
    pub stderr: String,
    /// Digest of the complete stdout stream.
    pub stdout_sha256: String,
    /// Digest of the complete stderr stream.
    pub stderr_sha256: String,
}

impl ExecOutcome {
    /// Whether the run counts as a success.
    pub fn ok(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn-level failures (the command never produced an outcome).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child could not be spawned at all.
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    /// Pipes were unexpectedly unavailable or broke mid-read.
    #[error("pipe io: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured stream: truncated bytes plus a digest of everything read.
struct Capped {
    bytes: Vec<u8>,
    sha256: String,
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Capped> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if bytes.len() < MAX_CAPTURE_BYTES {
            let take = n.min(MAX_CAPTURE_BYTES - bytes.len());
            bytes.extend_from_slice(&buf[..take]);
        }
    }
    Ok(Capped {
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Run `spec` to completion under `timeout`.
///
/// The spec is assumed to have already passed the policy guard; this
/// layer only enforces the runtime bounds.
pub async fn run(spec: &CommandSpec, timeout: Duration) -> Result<ExecOutcome, ExecError> {
    let started = Instant::now();

    let mut child = Command::new(&spec.cmd)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        // No stdin: a blocked read must not outlive the deadline.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ExecError::Spawn)?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Io(std::io::Error::other("stdout pipe unavailable")))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Io(std::io::Error::other("stderr pipe unavailable")))?;

    let stdout_task = tokio::spawn(read_capped(stdout_pipe));
    let stderr_task = tokio::spawn(read_capped(stderr_pipe));

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            timed_out = true;
            // SIGKILL; the child gets no chance to linger past its deadline.
            child.start_kill()?;
            child.wait().await?
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| ExecError::Io(std::io::Error::other(e)))??;
    let stderr = stderr_task
        .await
        .map_err(|e| ExecError::Io(std::io::Error::other(e)))??;

    let outcome = ExecOutcome {
        exit_code: status.code(),
        signal: signal_of(&status),
        timed_out,
        duration_ms: started.elapsed().as_millis() as u64,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        stdout_sha256: stdout.sha256,
        stderr_sha256: stderr.sha256,
    };
    debug!(
        cmd = %spec.cmd.display(),
        exit = ?outcome.exit_code,
        timed_out = outcome.timed_out,
        duration_ms = outcome.duration_ms,
        "command finished"
    );
    Ok(outcome)
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
