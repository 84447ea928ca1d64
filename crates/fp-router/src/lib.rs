// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Action router ("god gateway").
//!
//! One operator gesture flows through a fixed pipeline: normalize,
//! dedupe, allowlist, rate limit, vault-first intent, publish, result.
//! The audit record comes before the side effect, always; a request that
//! cannot be recorded is a request that does not happen.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fp_bus::MessageBus;
use fp_core::{ActionClass, Envelope, GodRequest, RawRequest, topics, topics::events};
use fp_error::{ErrorCode, PlaneError};
use fp_ratelimit::DispatchGate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Router state.
pub struct AppState {
    /// Identity stamped on audit events.
    pub node_id: String,
    /// Dedupe + rate windows.
    pub gate: Arc<DispatchGate>,
    /// Vault-first writer.
    pub vault: fp_vault::client::VaultClient,
    /// The messaging link.
    pub bus: Arc<dyn MessageBus>,
    /// Process start, for health uptime.
    pub started: Instant,
}

/// `POST /god` success body.
#[derive(Debug, Serialize, Deserialize)]
pub struct GodResponse {
    /// Always true on 200.
    pub ok: bool,
    /// The (possibly generated) request id.
    pub request_id: String,
    /// Dispatch details.
    pub result: Value,
}

/// Structured failure for `POST /god`.
#[derive(Debug)]
pub struct ApiError {
    /// Stable code from the plane taxonomy.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// The request id, when one was established before the failure.
    pub request_id: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotAllowlisted | ErrorCode::CapabilityDenied | ErrorCode::PolicyDenied => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::Duplicate => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::FailClosed | ErrorCode::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ExecutionFailed | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PlaneError> for ApiError {
    fn from(err: PlaneError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            request_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "ok": false,
            "error": self.code.as_str(),
            "message": self.message,
            "request_id": self.request_id,
        }));
        (self.status(), body).into_response()
    }
}

/// Build the router routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/god", post(cmd_god))
        .route("/health", get(cmd_health))
        .with_state(state)
}

async fn cmd_god(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<RawRequest>,
) -> Result<Json<GodResponse>, ApiError> {
    dispatch(&state, raw).await.map(Json)
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vault_reachable = state.vault.health().await;
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "vault_reachable": vault_reachable,
    }))
}

/// The full §4.4 pipeline for one request.
pub async fn dispatch(state: &AppState, raw: RawRequest) -> Result<GodResponse, ApiError> {
    let now = fp_core::now_ms();

    // 1. Normalize.
    let req = raw.normalize(now).map_err(|e| ApiError {
        code: ErrorCode::BadRequest,
        message: e.to_string(),
        request_id: None,
    })?;
    let request_id = req.request_id.clone();

    // 2. Dedupe.
    if state.gate.check_duplicate(&req.request_id, now) {
        return Err(deny(state, &req, ErrorCode::Duplicate, "duplicate request_id").await);
    }

    // 3. Allowlist.
    if !req.is_allowlisted() {
        return Err(deny(state, &req, ErrorCode::NotAllowlisted, "action not allowlisted").await);
    }
    let class = ActionClass::of(&req.action).ok_or_else(|| ApiError {
        code: ErrorCode::Internal,
        message: "allowlisted action without a class".into(),
        request_id: Some(request_id.clone()),
    })?;

    // 4. Rate limit.
    if state.gate.check_rate(class, now).is_err() {
        let message = format!("rate limit exceeded for {class}");
        return Err(deny(state, &req, ErrorCode::RateLimited, &message).await);
    }

    // 5. Vault-first intent.  Failure here means nothing gets published.
    let intent = Envelope::new(
        events::GOD_INTENT,
        state.node_id.clone(),
        json!({"request": req}),
    );
    state.vault.ingest_required(&intent).await.map_err(|e| {
        warn!(request_id = %request_id, "intent write failed; publishing nothing");
        ApiError {
            code: e.code,
            message: e.message,
            request_id: Some(request_id.clone()),
        }
    })?;

    // Dry run: record the would-be dispatch, publish nothing.
    if req.dry_run() {
        let result = json!({
            "dry_run": true,
            "ok": true,
            "request_id": req.request_id,
            "action": req.action,
        });
        audit_result(state, &result).await;
        info!(request_id = %req.request_id, action = %req.action, "dry run recorded");
        return Ok(GodResponse {
            ok: true,
            request_id,
            result,
        });
    }

    // 6. Dispatch on the generic and class topics.
    let payload = serde_json::to_value(&req).map_err(|e| ApiError {
        code: ErrorCode::Internal,
        message: format!("request unserializable: {e}"),
        request_id: Some(request_id.clone()),
    })?;
    let routed_topic = topics::class_topic(&req.action).unwrap_or(topics::GOD_BUTTON);
    for topic in [topics::GOD_BUTTON, routed_topic] {
        state
            .bus
            .publish(topic, payload.clone())
            .await
            .map_err(|e| ApiError {
                code: ErrorCode::TransientIo,
                message: format!("publish on {topic} failed: {e}"),
                request_id: Some(request_id.clone()),
            })?;
    }

    // 7. Result audit.
    let result = json!({
        "ok": true,
        "request_id": req.request_id,
        "result_summary": format!("dispatched {} to {}", req.action, routed_topic),
        "routed_topic": routed_topic,
    });
    audit_result(state, &result).await;
    info!(request_id = %req.request_id, action = %req.action, topic = routed_topic, "dispatched");

    Ok(GodResponse {
        ok: true,
        request_id,
        result,
    })
}

/// Write the denial event (best effort) and shape the error.
async fn deny(state: &AppState, req: &GodRequest, code: ErrorCode, reason: &str) -> ApiError {
    let env = Envelope::new(
        events::GOD_DENIED,
        state.node_id.clone(),
        json!({
            "request_id": req.request_id,
            "action": req.action,
            "reason": reason,
        }),
    );
    state.vault.ingest_best_effort(&env).await;
    warn!(request_id = %req.request_id, action = %req.action, reason, "denied");
    ApiError {
        code,
        message: reason.to_string(),
        request_id: Some(req.request_id.clone()),
    }
}

async fn audit_result(state: &AppState, result: &Value) {
    let env = Envelope::new(
        events::GOD_RESULT,
        state.node_id.clone(),
        result.clone(),
    );
    // The intent already made the request durable; the result record is
    // best-effort by the same rule as denials.
    state.vault.ingest_best_effort(&env).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fp_bus::LocalBus;
    use fp_store::EventStore;
    use std::time::Duration;

    struct Harness {
        state: Arc<AppState>,
        store: Arc<EventStore>,
        bus: LocalBus,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path().join("vault")));
        let vault_state = Arc::new(fp_vault::AppState::new(store.clone(), None, "vault-1".into()));
        let app = fp_vault::build_app(vault_state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let bus = LocalBus::default();
        let state = Arc::new(AppState {
            node_id: "router-1".into(),
            gate: Arc::new(DispatchGate::new()),
            vault: fp_vault::client::VaultClient::new(format!("http://{addr}")),
            bus: Arc::new(bus.clone()),
            started: Instant::now(),
        });
        Harness {
            state,
            store,
            bus,
            _dir: dir,
        }
    }

    fn raw(action: &str) -> RawRequest {
        RawRequest {
            action: Some(action.into()),
            ..Default::default()
        }
    }

    fn count_kind(store: &EventStore, kind: &str) -> usize {
        store
            .tail(1000)
            .unwrap()
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    #[tokio::test]
    async fn accepted_request_writes_intent_then_result() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::GOD_BUTTON]).await.unwrap();

        let resp = dispatch(&h.state, raw("ritual.rollcall")).await.unwrap();
        assert!(resp.ok);

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload["request_id"], json!(resp.request_id));

        let scan = h.store.tail(100).unwrap();
        let intents: Vec<_> = scan
            .events
            .iter()
            .filter(|e| e.kind == events::GOD_INTENT)
            .collect();
        let results: Vec<_> = scan
            .events
            .iter()
            .filter(|e| e.kind == events::GOD_RESULT)
            .collect();
        assert_eq!(intents.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(intents[0].request_id(), Some(resp.request_id.as_str()));
        assert_eq!(results[0].request_id(), Some(resp.request_id.as_str()));
    }

    #[tokio::test]
    async fn dry_run_records_but_never_publishes() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::GOD_BUTTON, topics::OPS_RITUAL]).await.unwrap();

        let mut request = raw("ritual.rollcall");
        request.args = json!({"dry_run": true});
        let resp = dispatch(&h.state, request).await.unwrap();
        assert!(resp.ok);
        assert_eq!(resp.result["dry_run"], json!(true));

        // No publication occurred.
        let nothing = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(nothing.is_err(), "dry run must not publish");

        assert_eq!(count_kind(&h.store, events::GOD_INTENT), 1);
        let scan = h.store.tail(100).unwrap();
        let result = scan
            .events
            .iter()
            .find(|e| e.kind == events::GOD_RESULT)
            .unwrap();
        assert_eq!(result.data["dry_run"], json!(true));
        assert_eq!(result.request_id(), Some(resp.request_id.as_str()));
    }

    #[tokio::test]
    async fn duplicate_request_id_is_denied_once() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::GOD_BUTTON]).await.unwrap();

        let mut first = raw("panic.freeze.agents");
        first.request_id = Some("abc".into());
        dispatch(&h.state, first.clone()).await.unwrap();
        sub.recv().await.unwrap();

        let err = dispatch(&h.state, first).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Duplicate);
        assert_eq!(err.message, "duplicate request_id");

        // Exactly one denial, no second publication.
        assert_eq!(count_kind(&h.store, events::GOD_DENIED), 1);
        assert_eq!(count_kind(&h.store, events::GOD_INTENT), 1);
        let nothing = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn unlisted_action_never_reaches_the_bus() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::GOD_BUTTON]).await.unwrap();

        let err = dispatch(&h.state, raw("shell.exec")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAllowlisted);

        assert_eq!(count_kind(&h.store, events::GOD_DENIED), 1);
        assert_eq!(count_kind(&h.store, events::GOD_INTENT), 0);
        let nothing = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn fourth_build_in_a_minute_is_rate_limited() {
        let h = harness().await;

        for _ in 0..3 {
            dispatch(&h.state, raw("build.flash.target")).await.unwrap();
        }
        let err = dispatch(&h.state, raw("build.flash.target")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.message, "rate limit exceeded for build");

        assert_eq!(count_kind(&h.store, events::GOD_INTENT), 3);
        assert_eq!(count_kind(&h.store, events::GOD_RESULT), 3);
        assert_eq!(count_kind(&h.store, events::GOD_DENIED), 1);
    }

    #[tokio::test]
    async fn legacy_op_translation() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::OPS_RITUAL]).await.unwrap();

        let request = RawRequest {
            op: Some("whoami".into()),
            ..Default::default()
        };
        dispatch(&h.state, request).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload["action"], json!("ritual.rollcall"));
    }

    #[tokio::test]
    async fn vault_down_fails_closed_and_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let _ = &dir;
        let bus = LocalBus::default();
        let state = AppState {
            node_id: "router-1".into(),
            gate: Arc::new(DispatchGate::new()),
            vault: fp_vault::client::VaultClient::new("http://127.0.0.1:9"),
            bus: Arc::new(bus.clone()),
            started: Instant::now(),
        };
        let mut sub = bus.subscribe(&[topics::GOD_BUTTON]).await.unwrap();

        let err = dispatch(&state, raw("snapshot.now")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FailClosed);

        let nothing = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(nothing.is_err(), "vault-first failure must not publish");
    }

    #[tokio::test]
    async fn transient_vault_errors_are_retried() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // Two 5xx responses, then success.
        Mock::given(method("POST"))
            .and(path("/v1/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/ingest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "path": "events/2026-08-01/ingest.ndjson", "derived": 0
            })))
            .mount(&server)
            .await;

        let bus = LocalBus::default();
        let state = AppState {
            node_id: "router-1".into(),
            gate: Arc::new(DispatchGate::new()),
            vault: fp_vault::client::VaultClient::new(server.uri()),
            bus: Arc::new(bus.clone()),
            started: Instant::now(),
        };
        let mut sub = bus.subscribe(&[topics::GOD_BUTTON]).await.unwrap();

        let resp = dispatch(&state, raw("snapshot.now")).await.unwrap();
        assert!(resp.ok);
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn node_scope_routes_to_claim_topic() {
        let h = harness().await;
        let mut sub = h.bus.subscribe(&[topics::OPS_CLAIM]).await.unwrap();

        let request = RawRequest {
            action: Some("node.claim".into()),
            scope: Some(fp_core::Scope::Node),
            target: Some("pi-04".into()),
            ..Default::default()
        };
        let resp = dispatch(&h.state, request).await.unwrap();
        assert_eq!(
            resp.result["routed_topic"],
            json!(topics::OPS_CLAIM)
        );
        assert_eq!(sub.recv().await.unwrap().payload["target"], json!("pi-04"));
    }
}
