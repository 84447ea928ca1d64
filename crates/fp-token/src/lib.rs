// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Short-lived room token issuer.
//!
//! Binds an identity to a messaging room for ten minutes.  The token is a
//! signed claim, verifiable by anyone holding the process secret.  Health
//! fails closed: a 503 here stops clients from trying to connect to a
//! dead messaging plane.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Token lifetime.
pub const TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

/// Issuer state.
pub struct AppState {
    /// Signing secret, generated at start or injected for verification.
    pub secret: [u8; 32],
    /// Messaging-plane URL probed by `/health`.
    pub gateway_url: Option<String>,
    http: reqwest::Client,
}

impl AppState {
    /// Fresh state with a random secret.
    pub fn new(gateway_url: Option<String>) -> Self {
        let mut secret = [0u8; 32];
        // Derive from a v4 uuid pair; good enough for a process-lifetime
        // signing key without pulling in a dedicated RNG.
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        secret[..16].copy_from_slice(a.as_bytes());
        secret[16..].copy_from_slice(b.as_bytes());
        Self {
            secret,
            gateway_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }
}

/// `POST /token` request body.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenRequest {
    /// Who is joining.
    pub identity: String,
    /// Which room.
    pub room: String,
}

/// `POST /token` response body.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The signed token.
    pub token: String,
    /// When it stops working.
    pub expires_at_ms: i64,
}

/// Mint a token binding `identity` to `room` until `expires_at_ms`.
pub fn mint(secret: &[u8; 32], identity: &str, room: &str, expires_at_ms: i64) -> String {
    let payload = format!("{identity}.{room}.{expires_at_ms}");
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(payload.as_bytes());
    let sig = hex::encode(hasher.finalize());
    format!("{payload}.{sig}")
}

/// Verify a token; returns the bound (identity, room) while unexpired.
pub fn verify(secret: &[u8; 32], token: &str, now_ms: i64) -> Option<(String, String)> {
    let mut parts = token.rsplitn(2, '.');
    let sig = parts.next()?;
    let payload = parts.next()?;

    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(payload.as_bytes());
    if hex::encode(hasher.finalize()) != sig {
        return None;
    }

    let mut fields = payload.rsplitn(2, '.');
    let expires_at_ms: i64 = fields.next()?.parse().ok()?;
    let head = fields.next()?;
    if expires_at_ms <= now_ms {
        return None;
    }
    let mut head_parts = head.splitn(2, '.');
    let identity = head_parts.next()?.to_string();
    let room = head_parts.next()?.to_string();
    Some((identity, room))
}

/// Build the issuer routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/token", post(cmd_token))
        .route("/health", get(cmd_health))
        .with_state(state)
}

async fn cmd_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, Response> {
    if req.identity.is_empty() || req.room.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "identity and room are required"})),
        )
            .into_response());
    }
    let expires_at_ms = fp_core::now_ms() + TOKEN_TTL_MS;
    let token = mint(&state.secret, &req.identity, &req.room, expires_at_ms);
    Ok(Json(TokenResponse {
        token,
        expires_at_ms,
    }))
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> Response {
    let reachable = match &state.gateway_url {
        // No plane configured: the issuer alone cannot vouch for anything.
        None => false,
        Some(url) => matches!(
            state.http.get(url).send().await,
            Ok(resp) if resp.status().is_success()
        ),
    };
    if reachable {
        Json(json!({"status": "ok", "messaging_plane": "reachable"})).into_response()
    } else {
        warn!("messaging plane unreachable; failing closed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "messaging_plane": "unreachable"})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn mint_and_verify() {
        let token = mint(&secret(), "operator-1", "lab", 10_000);
        let (identity, room) = verify(&secret(), &token, 5_000).unwrap();
        assert_eq!(identity, "operator-1");
        assert_eq!(room, "lab");
    }

    #[test]
    fn expired_token_rejected() {
        let token = mint(&secret(), "operator-1", "lab", 10_000);
        assert!(verify(&secret(), &token, 10_000).is_none());
    }

    #[test]
    fn tampered_token_rejected() {
        let token = mint(&secret(), "operator-1", "lab", 10_000);
        let forged = token.replace("operator-1", "operator-2");
        assert!(verify(&secret(), &forged, 0).is_none());
        assert!(verify(&[8u8; 32], &token, 0).is_none());
    }

    #[test]
    fn garbage_tokens_rejected() {
        assert!(verify(&secret(), "", 0).is_none());
        assert!(verify(&secret(), "a.b", 0).is_none());
        assert!(verify(&secret(), "no-dots-here", 0).is_none());
    }

    #[tokio::test]
    async fn token_endpoint_issues() {
        let state = Arc::new(AppState::new(None));
        let app = build_app(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/token"))
            .json(&TokenRequest {
                identity: "op".into(),
                room: "lab".into(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: TokenResponse = resp.json().await.unwrap();
        assert!(verify(&state.secret, &body.token, fp_core::now_ms()).is_some());

        // Health fails closed with no messaging plane configured.
        let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(health.status(), 503);
    }
}
