//! End-to-end test of the daemon wiring: HTTP gateway, tools, executor,
//! registry, reaper and workspaces over a scripted container runtime.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use agent_sandbox::{
    register_sandbox_tools, CommandExecutor, ContainerRegistry, DefaultToolRegistry, IdleReaper,
    MockRuntime, ScriptedExec,
};
use agent_sandbox_core::config::AppConfig;
use agent_sandbox_core::events::EventType;
use agent_sandbox_core::mocks::CollectingEventEmitter;
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_gateway::{AppState, GatewayConfig, GatewayServer};
use agent_sandbox_governance::{AuditLog, AuditLogEmitter, CompositeEventEmitter};
use agent_sandbox_workspace::WorkspaceManager;

struct System {
    app: Router,
    runtime: Arc<MockRuntime>,
    containers: Arc<ContainerRegistry>,
    workspaces: Arc<WorkspaceManager>,
    events: Arc<CollectingEventEmitter>,
    reaper: Arc<IdleReaper>,
    dir: tempfile::TempDir,
}

async fn boot(mut config: AppConfig) -> System {
    let dir = tempfile::tempdir().unwrap();
    config.workspace.base_dir = Some(dir.path().join("workspaces"));
    std::fs::create_dir_all(dir.path().join("workspaces")).unwrap();

    let collected = Arc::new(CollectingEventEmitter::new());
    let audit = Arc::new(AuditLogEmitter::open(dir.path().join("audit.jsonl")).unwrap());
    let events: Arc<dyn EventEmitter> =
        Arc::new(CompositeEventEmitter::new(vec![collected.clone(), audit]));

    let runtime = Arc::new(MockRuntime::new());
    let containers = Arc::new(
        ContainerRegistry::new(runtime.clone(), config.sandbox.clone())
            .with_event_emitter(events.clone()),
    );
    let executor = Arc::new(
        CommandExecutor::new(containers.clone()).with_event_emitter(events.clone()),
    );
    let workspaces = Arc::new(
        WorkspaceManager::from_settings(&config.workspace).with_event_emitter(events.clone()),
    );
    let reaper = Arc::new(IdleReaper::from_registry(containers.clone()));

    let tools = Arc::new(DefaultToolRegistry::new());
    register_sandbox_tools(
        tools.as_ref(),
        executor.clone(),
        workspaces.clone(),
        Some(events),
    )
    .await
    .unwrap();

    let state = AppState {
        tools,
        executor,
        containers: containers.clone(),
        workspaces: workspaces.clone(),
        reaper: reaper.clone(),
    };
    let app = GatewayServer::new(GatewayConfig::from(&config.server), state).build_router();

    System {
        app,
        runtime,
        containers,
        workspaces,
        events: collected,
        reaper,
        dir,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_agent_session_lifecycle() {
    let sys = boot(AppConfig::default()).await;

    // Write a script into the workspace and push it into the container
    let (status, _) = call(
        &sys.app,
        "POST",
        "/v1/sessions/agent-1/tools/workspace_write_file",
        json!({"path": "src/run.sh", "content": "echo built"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &sys.app,
        "POST",
        "/v1/sessions/agent-1/tools/sandbox_sync",
        json!({"direction": "push", "path": "src"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["files"], 1);

    // Run it
    sys.runtime.push_exec(ScriptedExec::exit(0, "built\n", ""));
    let (status, body) = call(
        &sys.app,
        "POST",
        "/v1/sessions/agent-1/tools/sandbox_shell",
        json!({"command": "sh src/run.sh"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["content"].as_str().unwrap().contains("built"));

    // Push and exec share the one container
    assert_eq!(sys.runtime.create_count(), 1);
    assert_eq!(sys.containers.len(), 1);

    // Tear down
    let (status, body) = call(&sys.app, "DELETE", "/v1/sessions/agent-1", json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["container_destroyed"], true);
    assert_eq!(body["workspace_released"], true);
    assert!(sys.containers.is_empty());
    assert_eq!(sys.workspaces.active_count(), 0);

    assert_eq!(sys.events.count(&EventType::SandboxCreated), 1);
    assert_eq!(sys.events.count(&EventType::SandboxDestroyed), 1);
    assert!(sys.events.count(&EventType::FsWrite) >= 1);

    let entries = AuditLog::verify(&sys.dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(entries, sys.events.events().len());
}

#[tokio::test]
async fn test_escape_attempt_is_forbidden_and_audited() {
    let sys = boot(AppConfig::default()).await;

    let (status, body) = call(
        &sys.app,
        "POST",
        "/v1/sessions/agent-2/tools/workspace_write_file",
        json!({"path": "../../../../tmp/owned", "content": "x"}),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "SECURITY_VIOLATION");
    assert_eq!(sys.events.count(&EventType::SecurityViolation), 1);
    assert_eq!(sys.runtime.create_count(), 0);
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let mut config = AppConfig::default();
    config.sandbox.idle_timeout_secs = 0;
    let sys = boot(config).await;

    for session in ["a", "b"] {
        let (status, _) = call(
            &sys.app,
            "POST",
            &format!("/v1/sessions/{}/exec", session),
            json!({"command": "true"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(sys.containers.len(), 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (status, body) = call(&sys.app, "POST", "/v1/admin/reap", json!(null)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reaped"], 2);
    assert_eq!(body["remaining"], 0);
    assert_eq!(sys.reaper.idle_timeout(), Duration::ZERO);
}
