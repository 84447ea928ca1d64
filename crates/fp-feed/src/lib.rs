// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Event feed reader.
//!
//! The read side of the plane: tails the event store (locally or through
//! ssh), filters by time, type, and source, reassembles per-request
//! traces, and aggregates per-node activity.  Readiness is cached and
//! refreshed in the background so health checks never walk the store.

/// Event sources and remote plumbing.
pub mod source;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use fp_core::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::json;
use source::EventSource;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Hard cap on events per `/events` response.
pub const MAX_EVENTS: usize = 500;
/// How far back a query may reach.
pub const MAX_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
/// Total tail lines per query.
pub const MAX_TAIL_LINES: usize = 8_000;
/// Tail lines per day file.
pub const MAX_LINES_PER_FILE: usize = 400;
/// Default trace scan depth.
pub const DEFAULT_SCAN_LIMIT: usize = 4_000;

/// Cached readiness.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadyState {
    /// Whether the last day-directory listing succeeded.
    pub ok: bool,
    /// When it last succeeded (ms).
    pub last_ok_ms: Option<i64>,
    /// Days visible at the last listing.
    pub days: usize,
    /// Last failure, if any.
    pub error: Option<String>,
}

/// Feed state.
pub struct AppState {
    /// Where events come from.
    pub source: EventSource,
    /// Cached readiness, refreshed by the background task.
    pub ready: RwLock<ReadyState>,
    /// Friendly labels for node ids (official + user overlay merged).
    pub aliases: BTreeMap<String, String>,
}

/// Load and merge the official and user alias maps.  Missing files are
/// empty maps; the user overlay wins on conflicts.
pub fn load_aliases(official: Option<&std::path::Path>, user: Option<&std::path::Path>) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for path in [official, user].into_iter().flatten() {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => merged.extend(map),
                Err(err) => warn!(path = %path.display(), error = %err, "alias map malformed; ignored"),
            },
            Err(_) => {}
        }
    }
    merged
}

/// Collect the newest events within the caps, oldest first.
async fn window(state: &AppState, since_ms: i64) -> Result<(Vec<Envelope>, usize), ApiError> {
    let mut days = state
        .source
        .list_days()
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    days.reverse();

    let floor = (fp_core::now_ms() - MAX_WINDOW_MS).max(since_ms);
    let mut events: Vec<Envelope> = Vec::new();
    let mut malformed = 0usize;
    let mut budget = MAX_TAIL_LINES;

    for day in days {
        if budget == 0 {
            break;
        }
        // A whole day older than the floor cannot contribute.
        let day_end = day
            .and_hms_opt(23, 59, 59)
            .map(|t| t.and_utc().timestamp_millis())
            .unwrap_or(i64::MAX);
        if day_end < floor {
            break;
        }
        let scan = state
            .source
            .tail_day(day, MAX_LINES_PER_FILE.min(budget))
            .await
            .map_err(|e| ApiError::unavailable(e.to_string()))?;
        malformed += scan.malformed_lines_skipped;
        budget = budget.saturating_sub(scan.events.len());
        let mut chunk: Vec<Envelope> = scan
            .events
            .into_iter()
            .filter(|e| e.ts_ms >= floor)
            .collect();
        chunk.append(&mut events);
        events = chunk;
    }
    Ok((events, malformed))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// `GET /events` parameters.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Max events returned (≤ 500).
    pub limit: Option<usize>,
    /// Only events at or after this producer time.
    pub since_ms: Option<i64>,
    /// Dotted type prefix filter.
    #[serde(alias = "typePrefix")]
    pub type_prefix: Option<String>,
    /// Source node filter.
    pub src: Option<String>,
}

/// `GET /trace` parameters.
#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    /// The request id to reassemble.
    pub request_id: String,
    /// Only events at or after this producer time.
    pub since_ms: Option<i64>,
    /// Max events returned.
    pub limit: Option<usize>,
    /// How many recent events to scan.
    pub scan_limit: Option<usize>,
}

/// `GET /nodes` parameters.
#[derive(Debug, Default, Deserialize)]
pub struct NodesQuery {
    /// Aggregation window in seconds (default 900).
    pub window_s: Option<i64>,
}

/// Structured feed error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Build the feed routes.  CORS is permissive so the web station can
/// query from wherever it is served.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(cmd_events))
        .route("/trace", get(cmd_trace))
        .route("/nodes", get(cmd_nodes))
        .route("/ready", get(cmd_ready))
        .route("/health", get(cmd_health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn cmd_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(MAX_EVENTS).min(MAX_EVENTS);
    let since = query.since_ms.unwrap_or(0);
    let (mut events, malformed) = window(&state, since).await?;

    if let Some(prefix) = &query.type_prefix {
        events.retain(|e| e.kind.starts_with(prefix.as_str()));
    }
    if let Some(src) = &query.src {
        events.retain(|e| &e.src == src);
    }

    // Newest first.
    events.reverse();
    events.truncate(limit);

    Ok(Json(json!({
        "events": events,
        "count": events.len(),
        "malformed_lines_skipped": malformed,
    })))
}

async fn cmd_trace(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TraceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.request_id.is_empty() {
        return Err(ApiError::bad_request("request_id is required"));
    }
    let limit = query.limit.unwrap_or(MAX_EVENTS).min(MAX_EVENTS);
    let scan_limit = query
        .scan_limit
        .unwrap_or(DEFAULT_SCAN_LIMIT)
        .min(MAX_TAIL_LINES);
    let since = query.since_ms.unwrap_or(0);

    let (events, malformed) = window(&state, since).await?;
    // Scan the most recent `scan_limit` events.
    let start = events.len().saturating_sub(scan_limit);
    let mut matched: Vec<&Envelope> = events[start..]
        .iter()
        .filter(|e| e.request_id() == Some(query.request_id.as_str()))
        .collect();
    matched.truncate(limit);

    Ok(Json(json!({
        "request_id": query.request_id,
        "events": matched,
        "count": matched.len(),
        "malformed_lines_skipped": malformed,
    })))
}

#[derive(Debug, Default, Serialize)]
struct NodeAggregate {
    last_seen_ms: i64,
    label: Option<String>,
    counts: BTreeMap<String, usize>,
}

async fn cmd_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window_s = query.window_s.unwrap_or(900).max(1);
    let since = fp_core::now_ms() - window_s * 1000;
    let (events, _) = window(&state, since).await?;

    let mut nodes: BTreeMap<String, NodeAggregate> = BTreeMap::new();
    for event in &events {
        let agg = nodes.entry(event.src.clone()).or_default();
        agg.last_seen_ms = agg.last_seen_ms.max(event.ts_ms);
        let family = event.kind.split('.').next().unwrap_or("").to_string();
        *agg.counts.entry(family).or_insert(0) += 1;
        if agg.label.is_none() {
            agg.label = state.aliases.get(&event.src).cloned();
        }
    }

    Ok(Json(json!({"window_s": window_s, "nodes": nodes})))
}

async fn cmd_ready(State(state): State<Arc<AppState>>) -> Response {
    let ready = state.ready.read().await.clone();
    let status = if ready.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!(ready))).into_response()
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.ready.read().await.clone();
    Json(json!({
        "status": if ready.ok { "ok" } else { "degraded" },
        "ready": ready,
        "time": Utc::now().to_rfc3339(),
    }))
}

/// Refresh the readiness cache once.
pub async fn refresh_ready(state: &AppState) {
    let outcome = state.source.list_days().await;
    let mut ready = state.ready.write().await;
    match outcome {
        Ok(days) => {
            ready.ok = true;
            ready.last_ok_ms = Some(fp_core::now_ms());
            ready.days = days.len();
            ready.error = None;
        }
        Err(err) => {
            ready.ok = false;
            ready.error = Some(err.to_string());
        }
    }
}

/// Keep the readiness cache warm.
pub fn spawn_ready_refresher(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            refresh_ready(&state).await;
        }
    })
}

/// Resolve the configured read mode into a source.
pub fn resolve_source(
    mode: fp_config::ReadMode,
    store_root: &std::path::Path,
    remote_host: Option<&str>,
    guard_cmd: &str,
) -> EventSource {
    use fp_config::ReadMode;
    match mode {
        ReadMode::Local => EventSource::Local(fp_store::EventStore::new(store_root)),
        ReadMode::Ssh => EventSource::Ssh {
            host: remote_host.unwrap_or("localhost").to_string(),
            root: store_root.to_path_buf(),
        },
        ReadMode::SshGuard => EventSource::SshGuard {
            host: remote_host.unwrap_or("localhost").to_string(),
            root: store_root.to_path_buf(),
            guard_cmd: guard_cmd.to_string(),
        },
        ReadMode::Auto => {
            if store_root.join("events").is_dir() || remote_host.is_none() {
                info!(root = %store_root.display(), "auto read mode: local");
                EventSource::Local(fp_store::EventStore::new(store_root))
            } else {
                info!("auto read mode: ssh");
                EventSource::Ssh {
                    host: remote_host.unwrap_or("localhost").to_string(),
                    root: store_root.to_path_buf(),
                }
            }
        }
    }
}
