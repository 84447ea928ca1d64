// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound client for the ingest surface.
//!
//! Everything that writes vault-first goes through here: the router, the
//! agents, and the SSH guard.  Transient failures (timeouts, connection
//! resets, 5xx) are retried with a small bounded backoff; 4xx responses
//! are terminal.

use crate::IngestResponse;
use fp_core::Envelope;
use fp_error::{ErrorCode, PlaneError};
use std::time::Duration;
use tracing::warn;

/// Retries after the first attempt.
const RETRIES: u32 = 2;
/// First backoff; doubles per retry.
const BACKOFF: Duration = Duration::from_millis(150);

/// HTTP client for `POST /v1/ingest`.
#[derive(Clone)]
pub struct VaultClient {
    base_url: String,
    http: reqwest::Client,
}

impl VaultClient {
    /// Client against `base_url` (e.g. `http://vault:8080`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Store one envelope, retrying transient failures.
    pub async fn ingest(&self, env: &Envelope) -> Result<IngestResponse, PlaneError> {
        let url = format!("{}/v1/ingest", self.base_url);
        let mut backoff = BACKOFF;
        let mut last_transient: Option<PlaneError> = None;

        for attempt in 0..=RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.http.post(&url).json(env).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<IngestResponse>().await.map_err(|e| {
                            PlaneError::new(ErrorCode::Internal, "ingest response undecodable")
                                .with_source(e)
                        });
                    }
                    if status.is_server_error() {
                        warn!(%status, attempt, "vault ingest 5xx; retrying");
                        last_transient = Some(
                            PlaneError::new(ErrorCode::TransientIo, "vault ingest 5xx")
                                .with_context("status", status.as_u16()),
                        );
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(PlaneError::bad_request("vault refused event")
                        .with_context("status", status.as_u16())
                        .with_context("body", body));
                }
                Err(err) => {
                    warn!(error = %err, attempt, "vault ingest unreachable; retrying");
                    last_transient = Some(
                        PlaneError::new(ErrorCode::TransientIo, "vault unreachable")
                            .with_source(err),
                    );
                }
            }
        }

        // Out of retries: the caller decides whether this is fail-closed.
        Err(last_transient
            .unwrap_or_else(|| PlaneError::internal("ingest retry loop exited impossibly")))
    }

    /// Store one envelope where vault-first is mandatory: exhausted
    /// retries become `fail_closed`.
    pub async fn ingest_required(&self, env: &Envelope) -> Result<IngestResponse, PlaneError> {
        self.ingest(env).await.map_err(|err| {
            if err.is_transient() {
                PlaneError::new(ErrorCode::FailClosed, "vault unreachable; refusing to proceed")
                    .with_context("kind", env.kind.clone())
            } else {
                err
            }
        })
    }

    /// Best-effort write: failures are logged and swallowed.
    pub async fn ingest_best_effort(&self, env: &Envelope) {
        if let Err(err) = self.ingest(env).await {
            warn!(error = %err, kind = %env.kind, "best-effort event dropped");
        }
    }

    /// Probe `GET /health`.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.http.get(&url).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}
