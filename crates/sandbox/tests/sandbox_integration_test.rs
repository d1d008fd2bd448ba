//! Sandbox integration tests.
//!
//! Tests the full pipeline: Tool → CommandExecutor → ContainerRegistry → MockRuntime.
//! These tests do NOT require Docker.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use agent_sandbox::{
    register_sandbox_tools, CommandExecutor, ContainerRegistry, DefaultToolRegistry, IdleReaper,
    MockRuntime, RuntimeCall, ScriptedExec,
};
use agent_sandbox_core::config::SandboxSettings;
use agent_sandbox_core::traits::ToolRegistry;
use agent_sandbox_core::types::{ExecRequest, SessionId};
use agent_sandbox_core::Error;
use agent_sandbox_workspace::WorkspaceManager;

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    runtime: Arc<MockRuntime>,
    containers: Arc<ContainerRegistry>,
    executor: Arc<CommandExecutor>,
    workspaces: Arc<WorkspaceManager>,
    tools: DefaultToolRegistry,
    _base: tempfile::TempDir,
}

async fn harness() -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    let containers = Arc::new(ContainerRegistry::new(
        runtime.clone(),
        SandboxSettings::default(),
    ));
    let executor = Arc::new(CommandExecutor::new(containers.clone()));
    let base = tempfile::tempdir().unwrap();
    let workspaces = Arc::new(WorkspaceManager::new(base.path(), "it-ws"));

    let tools = DefaultToolRegistry::new();
    register_sandbox_tools(&tools, executor.clone(), workspaces.clone(), None)
        .await
        .unwrap();

    Harness {
        runtime,
        containers,
        executor,
        workspaces,
        tools,
        _base: base,
    }
}

fn tar_of(files: &[(&str, &str)]) -> bytes::Bytes {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, path, body.as_bytes())
            .unwrap();
    }
    bytes::Bytes::from(builder.into_inner().unwrap())
}

// =============================================================================
// 1. One container per session, reused across commands
// =============================================================================

#[tokio::test]
async fn test_commands_share_session_container() {
    let h = harness().await;

    for _ in 0..3 {
        let out = h
            .tools
            .execute("sandbox_shell", json!({"session_id": "s1", "command": "ls"}))
            .await
            .unwrap();
        assert!(out.success);
    }

    assert_eq!(h.runtime.create_count(), 1);
    assert_eq!(h.containers.len(), 1);
}

// =============================================================================
// 2. Sessions are isolated from each other
// =============================================================================

#[tokio::test]
async fn test_concurrent_sessions_get_own_containers() {
    let h = harness().await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let executor = h.executor.clone();
            tokio::spawn(async move {
                executor
                    .exec_command(&ExecRequest::new(format!("session-{}", i), "true"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().success());
    }

    assert_eq!(h.runtime.create_count(), 8);
    assert_eq!(h.containers.len(), 8);
}

// =============================================================================
// 3. Output streams arrive separated
// =============================================================================

#[tokio::test]
async fn test_stdout_and_stderr_separated_through_tool() {
    let h = harness().await;
    h.runtime
        .push_exec(ScriptedExec::exit(2, "partial result\n", "warning: disk\n"));

    let out = h
        .tools
        .execute(
            "sandbox_shell",
            json!({"session_id": "s1", "command": "./build.sh"}),
        )
        .await
        .unwrap();

    assert!(!out.success);
    assert!(out
        .content
        .contains("partial result\n\n--- stderr ---\nwarning: disk"));
    assert_eq!(out.data.unwrap()["exit_code"], 2);
}

// =============================================================================
// 4. Destroy then recreate
// =============================================================================

#[tokio::test]
async fn test_destroy_then_exec_recreates() {
    let h = harness().await;
    let session = SessionId::from("s1");

    let first = h.containers.get_or_create(&session).await.unwrap();
    assert!(h.containers.destroy(&session).await.unwrap());

    h.executor
        .exec_command(&ExecRequest::new(session.clone(), "true"))
        .await
        .unwrap();
    let second = h.containers.get_or_create(&session).await.unwrap();

    assert_ne!(first.id, second.id);
    let removed: Vec<_> = h
        .runtime
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RuntimeCall::RemoveContainer(_)))
        .collect();
    assert_eq!(removed, vec![RuntimeCall::RemoveContainer(first.id)]);
}

// =============================================================================
// 5. Reaper spares busy sessions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reaper_skips_session_with_running_command() {
    let h = harness().await;
    let session = SessionId::from("busy");
    h.runtime
        .push_exec(ScriptedExec::ok("done").with_running_polls(usize::MAX));

    let executor = Arc::new(
        CommandExecutor::new(h.containers.clone()).with_exit_settle(Duration::from_secs(3600)),
    );
    let running = {
        let executor = executor.clone();
        let session = session.clone();
        tokio::spawn(async move {
            executor
                .exec_command(&ExecRequest::new(session, "sleep 3000"))
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(120)).await;
    let reaper = IdleReaper::new(h.containers.clone(), Duration::from_secs(60));
    assert_eq!(reaper.cleanup_expired().await, 0);
    assert!(h.containers.contains(&session));

    running.abort();
}

// =============================================================================
// 6. File tools and sync
// =============================================================================

#[tokio::test]
async fn test_pull_into_workspace_then_read() {
    let h = harness().await;
    h.runtime
        .insert_archive("/workspace/out", tar_of(&[("out/report.txt", "all green")]));

    let out = h
        .tools
        .execute(
            "sandbox_sync",
            json!({"session_id": "s1", "direction": "pull", "path": "out"}),
        )
        .await
        .unwrap();
    assert_eq!(out.data.unwrap()["files"], 1);

    let read = h
        .tools
        .execute(
            "workspace_read_file",
            json!({"session_id": "s1", "path": "out/report.txt"}),
        )
        .await
        .unwrap();
    assert_eq!(read.content, "all green");
}

#[tokio::test]
async fn test_pull_with_escaping_entry_is_rejected() {
    let h = harness().await;

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.as_old_mut().name[..12].copy_from_slice(b"../../pwned!");
    header.set_cksum();
    builder.append(&header, &b"evil"[..]).unwrap();
    h.runtime
        .insert_archive("/workspace/.", bytes::Bytes::from(builder.into_inner().unwrap()));

    let err = h
        .tools
        .execute("sandbox_sync", json!({"session_id": "s1", "direction": "pull"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SecurityViolation(_)));

    let ws = h.workspaces.get(&"s1".into()).unwrap();
    assert!(!ws.root().parent().unwrap().join("pwned!").exists());
}

#[tokio::test]
async fn test_traversal_never_reaches_filesystem() {
    let h = harness().await;

    for path in ["../escape.txt", "a/../../escape.txt", "/etc/passwd", "C:\\Windows\\x"] {
        let err = h
            .tools
            .execute(
                "workspace_write_file",
                json!({"session_id": "s1", "path": path, "content": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecurityViolation(_)), "{}", path);
    }

    let ws = h.workspaces.get(&"s1".into()).unwrap();
    assert!(!ws.root().parent().unwrap().join("escape.txt").exists());
    assert_eq!(std::fs::read_dir(ws.root()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unknown_tool() {
    let h = harness().await;
    let err = h
        .tools
        .execute("rm_rf", json!({"session_id": "s1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolNotFound(_)));
}
