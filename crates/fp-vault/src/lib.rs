// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Vault ingest service.
//!
//! The single write surface for the event store: validates envelopes,
//! appends them, and derives BLE identity events from observations.  The
//! append is the transaction; derived events are best-effort and never
//! roll back the original.

/// Outbound client for the ingest surface.
pub mod client;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use fp_ble::BleRegistry;
use fp_core::{Envelope, topics::events};
use fp_store::EventStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

/// Shared state behind the ingest routes.
pub struct AppState {
    /// The append-only store.
    pub store: Arc<EventStore>,
    /// BLE registry, when SQLite came up.
    pub registry: Option<Arc<BleRegistry>>,
    /// Why the registry did not come up, when it did not.
    pub ble_init_error: Option<String>,
    /// Identity stamped on derived events.
    pub node_id: String,
}

impl AppState {
    /// Build state, attempting to open the BLE registry at `ble_db`.
    pub fn new(store: Arc<EventStore>, ble_db: Option<&PathBuf>, node_id: String) -> Self {
        let (registry, ble_init_error) = match ble_db {
            None => (None, None),
            Some(path) => match BleRegistry::open(path) {
                Ok(reg) => (Some(Arc::new(reg)), None),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ble registry unavailable");
                    (None, Some(err.to_string()))
                }
            },
        };
        Self {
            store,
            registry,
            ble_init_error,
            node_id,
        }
    }
}

/// Structured API error.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error response.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

/// Response body for a stored event.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Always true on 200.
    pub ok: bool,
    /// Where the event landed.
    pub path: String,
    /// How many derived events were appended alongside it.
    pub derived: usize,
}

/// Build the Axum router with all vault routes.
///
/// CORS is permissive: sensors and bench tooling post from anywhere on
/// the lab network.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ingest", post(cmd_ingest))
        .route("/health", get(cmd_health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn cmd_ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<IngestResponse>, ApiError> {
    let env = Envelope::from_value(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.code(), e.to_string()))?;

    let path = state.store.append(&env).await.map_err(|e| {
        error!(error = %e, kind = %env.kind, "append failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "append_failed", e.to_string())
    })?;

    let mut derived = 0usize;
    if env.kind == "ble.observation" || env.kind.starts_with("ble.observation.") {
        derived = derive_ble_events(&state, &env).await;
    }

    Ok(Json(IngestResponse {
        ok: true,
        path: path.display().to_string(),
        derived,
    }))
}

/// Run an observation through the registry and append what falls out.
/// Best-effort: failures are logged, the original event stays stored.
async fn derive_ble_events(state: &AppState, env: &Envelope) -> usize {
    let Some(registry) = &state.registry else {
        return 0;
    };
    let obs: fp_ble::BleObservation = match serde_json::from_value(env.data.clone()) {
        Ok(obs) => obs,
        Err(err) => {
            warn!(error = %err, "unparseable ble observation; nothing derived");
            return 0;
        }
    };

    let outcome = match registry.observe(&obs) {
        Ok(o) => o,
        Err(err) => {
            warn!(error = %err, "ble registry rejected observation");
            return 0;
        }
    };

    let mut derived = 0usize;
    let seen = Envelope::new(
        events::BLE_DEVICE_SEEN,
        state.node_id.clone(),
        serde_json::to_value(&outcome.seen).unwrap_or(Value::Null),
    );
    match state.store.append(&seen).await {
        Ok(_) => derived += 1,
        Err(err) => warn!(error = %err, "derived seen event dropped"),
    }
    if let Some(merged) = &outcome.merged {
        let merged_env = Envelope::new(
            events::BLE_DEVICE_MERGED,
            state.node_id.clone(),
            serde_json::to_value(merged).unwrap_or(Value::Null),
        );
        match state.store.append(&merged_env).await {
            Ok(_) => derived += 1,
            Err(err) => warn!(error = %err, "derived merge event dropped"),
        }
    }
    derived
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "store_root": state.store.root().display().to_string(),
        "ble_registry_active": state.registry.is_some(),
        "ble_init_error": state.ble_init_error,
        "time": Utc::now().to_rfc3339(),
    }))
}
