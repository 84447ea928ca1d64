// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end dispatch: operator request through the router, over the
//! in-process bus, into a live agent, with every audit record landing in
//! one shared vault.

use fp_agent::{Agent, AgentIdentity, Modes, Platform};
use fp_bus::LocalBus;
use fp_capability::CapabilityCell;
use fp_core::{RawRequest, topics::events};
use fp_policy::{AllowRule, CommandAllowlist};
use fp_ratelimit::DispatchGate;
use fp_router::AppState as RouterState;
use fp_store::EventStore;
use fp_vault::client::VaultClient;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Plane {
    router: Arc<RouterState>,
    store: Arc<EventStore>,
    _dir: tempfile::TempDir,
}

async fn bring_up() -> Plane {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EventStore::new(dir.path().join("vault")));

    // Vault.
    let vault_state = Arc::new(fp_vault::AppState::new(store.clone(), None, "vault-1".into()));
    let app = fp_vault::build_app(vault_state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let vault_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let vault_url = format!("http://{vault_addr}");

    // Shared bus.
    let bus = LocalBus::default();

    // Agent with a permissive matrix and a df/echo allowlist.
    let caps = serde_json::from_value(json!({
        "node_id": "pi-04",
        "roles": ["tier1"],
        "capabilities": {
            "panic": {"enabled": true},
            "snapshot": {"enabled": true},
            "maint": {"enabled": true, "tools": ["df"]},
            "scan": {"enabled": true},
            "build": {"enabled": true},
            "ritual": {"enabled": true}
        }
    }))
    .unwrap();
    let mut commands = BTreeMap::new();
    commands.insert(
        PathBuf::from("/bin/df"),
        AllowRule {
            max_args: 2,
            cwd_roots: vec![dir.path().to_path_buf()],
            ..Default::default()
        },
    );
    let agent = Arc::new(Agent {
        identity: AgentIdentity {
            node_id: "pi-04".into(),
            device_id: "devboard-9".into(),
            role: "tier1".into(),
            platform: Platform::Pi,
        },
        caps: CapabilityCell::fixed(caps),
        caps_path: dir.path().join("caps.json"),
        allowlist: CommandAllowlist { commands },
        gate: DispatchGate::new(),
        vault: VaultClient::new(vault_url.clone()),
        modes: Mutex::new(Modes::default()),
        claim_db_path: dir.path().join("claim.json"),
        work_dir: dir.path().to_path_buf(),
        default_timeout: Duration::from_secs(10),
    });
    let agent_bus: Arc<LocalBus> = Arc::new(bus.clone());
    tokio::spawn(async move {
        let _ = fp_agent::run(agent, agent_bus).await;
    });
    // Let the subscription land before anything publishes.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let router = Arc::new(RouterState {
        node_id: "router-1".into(),
        gate: Arc::new(DispatchGate::new()),
        vault: VaultClient::new(vault_url),
        bus: Arc::new(bus.clone()),
        started: Instant::now(),
    });

    Plane {
        router,
        store,
        _dir: dir,
    }
}

async fn wait_for_kind(store: &EventStore, kind: &str) -> fp_core::Envelope {
    for _ in 0..100 {
        if let Some(env) = store
            .tail(1000)
            .unwrap()
            .events
            .into_iter()
            .find(|e| e.kind == kind)
        {
            return env;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no {kind} event arrived");
}

#[tokio::test]
async fn rollcall_flows_router_to_agent_to_vault() {
    let plane = bring_up().await;

    let raw = RawRequest {
        op: Some("whoami".into()),
        ..Default::default()
    };
    let resp = fp_router::dispatch(&plane.router, raw).await.unwrap();
    assert!(resp.ok);

    let claim = wait_for_kind(&plane.store, "node.claim.result").await;
    assert_eq!(claim.data["node_id"], json!("pi-04"));
    assert_eq!(claim.request_id(), Some(resp.request_id.as_str()));

    // The full audit chain for one request id.
    let scan = plane.store.tail(1000).unwrap();
    let of_request: Vec<&str> = scan
        .events
        .iter()
        .filter(|e| e.request_id() == Some(resp.request_id.as_str()))
        .map(|e| e.kind.as_str())
        .collect();
    assert!(of_request.contains(&events::GOD_INTENT));
    assert!(of_request.contains(&events::GOD_RESULT));
    assert!(of_request.contains(&"node.claim.intent"));
    assert!(of_request.contains(&"node.claim.result"));
    assert!(of_request.contains(&events::AGENT_EXEC_INTENT));
    assert!(of_request.contains(&events::AGENT_EXEC_RESULT));
}

#[tokio::test]
async fn maintenance_command_executes_on_the_agent() {
    let plane = bring_up().await;

    let raw = RawRequest {
        action: Some("maint.disk.df".into()),
        ..Default::default()
    };
    let resp = fp_router::dispatch(&plane.router, raw).await.unwrap();

    let result = wait_for_kind(&plane.store, "node.maintenance.result").await;
    assert_eq!(result.request_id(), Some(resp.request_id.as_str()));
    assert_eq!(result.data["ok"], json!(true));
    assert_eq!(result.data["exit_code"], json!(0));
    assert!(!result.data["stdout"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn node_scoped_request_for_another_node_is_ignored() {
    let plane = bring_up().await;

    let raw = RawRequest {
        action: Some("node.claim".into()),
        scope: Some(fp_core::Scope::Node),
        target: Some("mac-01".into()),
        ..Default::default()
    };
    let resp = fp_router::dispatch(&plane.router, raw).await.unwrap();
    assert!(resp.ok);

    // The router audited the dispatch, but no agent-side events appear.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let scan = plane.store.tail(1000).unwrap();
    assert!(
        !scan
            .events
            .iter()
            .any(|e| e.kind.starts_with("node.claim.")),
        "agent must not act on another node's claim"
    );
}
