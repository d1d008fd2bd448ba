//! Agent-facing tools implementing the `Tool` trait.
//!
//! Every tool takes a `session_id` argument. Shell commands run in the
//! session's container; file tools operate on the session's host workspace
//! and never touch a path the resolver has not accepted.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_sandbox_core::events::{EventEnvelope, EventSeverity, EventType, FsPayload};
use agent_sandbox_core::traits::{EventEmitter, Tool};
use agent_sandbox_core::types::{ExecRequest, ExecResult, SessionId, ToolOutput, ToolRiskLevel};
use agent_sandbox_core::{Error, Result};
use agent_sandbox_workspace::{to_virtual_path, Workspace, WorkspaceManager};

use crate::archive::ArchiveSync;
use crate::executor::CommandExecutor;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_READ_BYTES: u64 = 1024 * 1024;
const DEFAULT_SEARCH_RESULTS: usize = 100;
const MAX_SEARCH_RESULTS: usize = 1000;

fn session_arg(args: &Value) -> Result<SessionId> {
    args.get("session_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
        .ok_or_else(|| Error::invalid_request("session_id is required"))
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_request(format!("{} is required", name)))
}

fn opt_str_arg<'a>(args: &'a Value, name: &str) -> &'a str {
    args.get(name).and_then(|v| v.as_str()).unwrap_or("")
}

// =============================================================================
// Workspace Access
// =============================================================================

/// Resolves tool paths inside session workspaces and audits file access.
pub struct WorkspaceAccess {
    workspaces: Arc<WorkspaceManager>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl WorkspaceAccess {
    pub fn new(workspaces: Arc<WorkspaceManager>) -> Self {
        Self {
            workspaces,
            event_emitter: None,
        }
    }

    /// Set an event emitter for auditing.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    /// Open the session's workspace and resolve `virtual_path` inside it.
    pub async fn resolve(&self, session_id: &SessionId, virtual_path: &str) -> Result<(Workspace, PathBuf)> {
        let workspace = self.workspaces.open(session_id).await?;
        let checked = match workspace.resolve(virtual_path) {
            Ok(actual) => workspace.ensure_contained(&actual).await.map(|_| actual),
            Err(e) => Err(e),
        };

        match checked {
            Ok(actual) => Ok((workspace, actual)),
            Err(e) => {
                if matches!(e, Error::SecurityViolation(_)) {
                    tracing::warn!(session_id = %session_id, path = %virtual_path, error = %e, "Rejected workspace path");
                    self.emit(
                        session_id,
                        EventType::SecurityViolation,
                        EventSeverity::Warning,
                        json!({ "path": virtual_path, "reason": e.to_string() }),
                    )
                    .await;
                }
                Err(e)
            }
        }
    }

    async fn audit(&self, session_id: &SessionId, event_type: EventType, payload: FsPayload) {
        let severity = if payload.success {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        let payload = serde_json::to_value(payload).unwrap_or_default();
        self.emit(session_id, event_type, severity, payload).await;
    }

    async fn emit(&self, session_id: &SessionId, event_type: EventType, severity: EventSeverity, payload: Value) {
        if let Some(ref emitter) = self.event_emitter {
            emitter
                .emit(
                    EventEnvelope::new(event_type, payload)
                        .with_session(session_id.as_str())
                        .with_actor("workspace-tools")
                        .with_severity(severity),
                )
                .await;
        }
    }
}

fn fs_payload(path: &str, operation: &str, size_bytes: Option<u64>, outcome: &Result<()>) -> FsPayload {
    FsPayload {
        path: path.to_string(),
        operation: operation.to_string(),
        size_bytes,
        success: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    }
}

// =============================================================================
// Sandbox Shell Tool
// =============================================================================

/// Tool for executing shell commands inside the session's container.
///
/// Risk level: HIGH.
pub struct SandboxShellTool {
    executor: Arc<CommandExecutor>,
}

impl SandboxShellTool {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self { executor }
    }

    /// `None` when the command did not finish within `timeout`.
    async fn run(&self, request: &ExecRequest, timeout: Duration) -> Result<Option<ExecResult>> {
        match tokio::time::timeout(timeout, self.executor.exec_command(request)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl Tool for SandboxShellTool {
    fn name(&self) -> &str {
        "sandbox_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the session's isolated container. \
         The container has no access to the host system. \
         Commands run as a non-root user in /workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session that owns the container"
                },
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 30, max: 300)",
                    "default": DEFAULT_TIMEOUT_SECS
                }
            },
            "required": ["session_id", "command"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::High
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let command = str_arg(&args, "command")?;
        let timeout_secs = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);
        let timeout = Duration::from_secs(timeout_secs);

        let request = ExecRequest::new(session_id.clone(), command);
        let outcome = match self.run(&request, timeout).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(session_id = %session_id, error = %e, "Sandbox unavailable, retrying once");
                self.run(&request, timeout).await
            }
            other => other,
        };

        let Some(result) = outcome? else {
            // The process may still be running; tear the container down
            if let Err(e) = self.executor.registry().destroy(&session_id).await {
                tracing::error!(session_id = %session_id, error = %e, "Failed to destroy timed-out sandbox");
            }
            return Ok(ToolOutput::error(format!(
                "Command timed out after {}s. The sandbox was reset.",
                timeout_secs
            ))
            .with_data(json!({ "exit_code": null, "timed_out": true })));
        };

        let mut output = String::new();
        if !result.stdout.is_empty() {
            output.push_str(&result.stdout);
        }
        if !result.stderr.is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&result.stderr);
        }

        let data = json!({ "exit_code": result.exit_code, "timed_out": false });
        match result.exit_code {
            Some(0) => {
                if output.is_empty() {
                    output = "Command completed with exit code 0".to_string();
                }
                Ok(ToolOutput::text(output).with_data(data))
            }
            Some(code) => Ok(ToolOutput::error(format!(
                "Command failed (exit code {}):\n{}",
                code, output
            ))
            .with_data(data)),
            None => Ok(ToolOutput::error(format!(
                "Command output closed but the process had not exited:\n{}",
                output
            ))
            .with_data(data)),
        }
    }
}

// =============================================================================
// Workspace Write File Tool
// =============================================================================

/// Tool for writing files into the session workspace.
///
/// Risk level: MEDIUM.
pub struct WorkspaceWriteFileTool {
    access: Arc<WorkspaceAccess>,
}

impl WorkspaceWriteFileTool {
    pub fn new(access: Arc<WorkspaceAccess>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl Tool for WorkspaceWriteFileTool {
    fn name(&self) -> &str {
        "workspace_write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the session workspace. \
         Path is relative to the workspace root; parent directories are created."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace (e.g. 'main.py', 'src/app.js')"
                },
                "content": {
                    "type": "string",
                    "description": "The file content to write"
                }
            },
            "required": ["session_id", "path", "content"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;

        let (workspace, actual) = self.access.resolve(&session_id, path).await?;
        if actual == workspace.root() {
            return Err(Error::invalid_request("path must name a file"));
        }

        let outcome = async {
            if let Some(parent) = actual.parent() {
                tokio::fs::create_dir_all(parent).await?;
                workspace.ensure_contained(parent).await?;
            }
            tokio::fs::write(&actual, content).await?;
            Ok::<(), Error>(())
        }
        .await;

        self.access
            .audit(
                &session_id,
                EventType::FsWrite,
                fs_payload(path, "write", Some(content.len() as u64), &outcome),
            )
            .await;
        outcome?;

        Ok(ToolOutput::text(format!(
            "File written: {} ({} bytes)",
            path,
            content.len()
        )))
    }
}

// =============================================================================
// Workspace Read File Tool
// =============================================================================

/// Tool for reading files from the session workspace.
///
/// Risk level: LOW.
pub struct WorkspaceReadFileTool {
    access: Arc<WorkspaceAccess>,
}

impl WorkspaceReadFileTool {
    pub fn new(access: Arc<WorkspaceAccess>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl Tool for WorkspaceReadFileTool {
    fn name(&self) -> &str {
        "workspace_read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the session workspace. Path is relative to the workspace root."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace"
                }
            },
            "required": ["session_id", "path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let path = str_arg(&args, "path")?;

        let (_, actual) = self.access.resolve(&session_id, path).await?;

        let mut size = None;
        let read = async {
            let meta = tokio::fs::metadata(&actual).await?;
            size = Some(meta.len());
            if !meta.is_file() {
                return Err(Error::invalid_request(format!("{} is not a file", path)));
            }
            if meta.len() > MAX_READ_BYTES {
                return Err(Error::invalid_request(format!(
                    "{} is too large to read ({} bytes, limit {})",
                    path,
                    meta.len(),
                    MAX_READ_BYTES
                )));
            }
            Ok::<_, Error>(tokio::fs::read(&actual).await?)
        }
        .await;

        let outcome = read.as_ref().map(|_| ()).map_err(|e| Error::workspace(e.to_string()));
        self.access
            .audit(&session_id, EventType::FsRead, fs_payload(path, "read", size, &outcome))
            .await;

        let bytes = read?;
        Ok(ToolOutput::text(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

// =============================================================================
// Workspace List Files Tool
// =============================================================================

/// Tool for listing a directory of the session workspace.
///
/// Risk level: LOW.
pub struct WorkspaceListFilesTool {
    access: Arc<WorkspaceAccess>,
}

impl WorkspaceListFilesTool {
    pub fn new(access: Arc<WorkspaceAccess>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl Tool for WorkspaceListFilesTool {
    fn name(&self) -> &str {
        "workspace_list_files"
    }

    fn description(&self) -> &str {
        "List files and directories in the session workspace. \
         Path is relative to the workspace root (default: the root)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace",
                    "default": "."
                }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let path = opt_str_arg(&args, "path");

        let (_, actual) = self.access.resolve(&session_id, path).await?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&actual).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_symlink() {
                "symlink"
            } else if file_type.is_dir() {
                "dir"
            } else {
                "file"
            };
            let size = if kind == "file" {
                entry.metadata().await.map(|m| m.len()).ok()
            } else {
                None
            };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind, size));
        }
        entries.sort();

        self.access
            .audit(&session_id, EventType::FsRead, fs_payload(path, "list", None, &Ok(())))
            .await;

        if entries.is_empty() {
            return Ok(ToolOutput::text("(empty directory)").with_data(json!([])));
        }

        let listing = entries
            .iter()
            .map(|(name, kind, _)| match *kind {
                "dir" => format!("{}/", name),
                _ => name.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let data: Vec<Value> = entries
            .iter()
            .map(|(name, kind, size)| json!({ "name": name, "kind": kind, "size": size }))
            .collect();

        Ok(ToolOutput::text(listing).with_data(Value::Array(data)))
    }
}

// =============================================================================
// Workspace Search Tool
// =============================================================================

/// Tool for regex search over text files in the session workspace.
///
/// Risk level: LOW.
pub struct WorkspaceSearchTool {
    access: Arc<WorkspaceAccess>,
}

impl WorkspaceSearchTool {
    pub fn new(access: Arc<WorkspaceAccess>) -> Self {
        Self { access }
    }
}

/// Walk `start` without following symlinks and collect matching lines.
async fn search_tree(root: &Path, start: &Path, pattern: &Regex, limit: usize) -> Result<(Vec<Value>, bool)> {
    let mut matches = Vec::new();
    let mut pending = vec![start.to_path_buf()];

    while let Some(path) = pending.pop() {
        let meta = tokio::fs::symlink_metadata(&path).await?;
        if meta.is_dir() {
            let mut dir = tokio::fs::read_dir(&path).await?;
            let mut children = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();
            // Reverse so the stack yields children in name order
            pending.extend(children.into_iter().rev());
            continue;
        }
        if !meta.is_file() || meta.len() > MAX_READ_BYTES {
            continue;
        }

        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            continue; // binary or not UTF-8
        };
        let display = to_virtual_path(root, &path).unwrap_or_default();
        for (idx, line) in text.lines().enumerate() {
            if pattern.is_match(line) {
                if matches.len() >= limit {
                    return Ok((matches, true));
                }
                matches.push(json!({ "path": display, "line": idx + 1, "text": line }));
            }
        }
    }

    Ok((matches, false))
}

#[async_trait]
impl Tool for WorkspaceSearchTool {
    fn name(&self) -> &str {
        "workspace_search"
    }

    fn description(&self) -> &str {
        "Search text files in the session workspace for lines matching a regular expression."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: the whole workspace)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of matching lines (default: 100)",
                    "default": DEFAULT_SEARCH_RESULTS
                }
            },
            "required": ["session_id", "pattern"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let pattern = str_arg(&args, "pattern")?;
        let path = opt_str_arg(&args, "path");
        let limit = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SEARCH_RESULTS)
            .clamp(1, MAX_SEARCH_RESULTS);

        let regex = Regex::new(pattern)
            .map_err(|e| Error::invalid_request(format!("Invalid pattern: {}", e)))?;
        let (workspace, actual) = self.access.resolve(&session_id, path).await?;

        let (matches, truncated) = search_tree(workspace.root(), &actual, &regex, limit).await?;

        self.access
            .audit(&session_id, EventType::FsRead, fs_payload(path, "search", None, &Ok(())))
            .await;

        if matches.is_empty() {
            return Ok(ToolOutput::text("No matches found").with_data(json!({ "matches": [], "truncated": false })));
        }

        let mut content = matches
            .iter()
            .map(|m| {
                format!(
                    "{}:{}: {}",
                    m["path"].as_str().unwrap_or_default(),
                    m["line"],
                    m["text"].as_str().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            content.push_str(&format!("\n(results truncated at {})", limit));
        }

        Ok(ToolOutput::text(content).with_data(json!({ "matches": matches, "truncated": truncated })))
    }
}

// =============================================================================
// Sandbox Sync Tool
// =============================================================================

/// Tool for copying files between the workspace and the container.
///
/// Risk level: MEDIUM.
pub struct SandboxSyncTool {
    sync: Arc<ArchiveSync>,
    access: Arc<WorkspaceAccess>,
}

impl SandboxSyncTool {
    pub fn new(sync: Arc<ArchiveSync>, access: Arc<WorkspaceAccess>) -> Self {
        Self { sync, access }
    }
}

#[async_trait]
impl Tool for SandboxSyncTool {
    fn name(&self) -> &str {
        "sandbox_sync"
    }

    fn description(&self) -> &str {
        "Copy files between the session workspace and the container's /workspace. \
         'push' uploads workspace files, 'pull' downloads container files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "direction": {
                    "type": "string",
                    "enum": ["push", "pull"]
                },
                "path": {
                    "type": "string",
                    "description": "File or directory relative to the workspace (default: everything)"
                }
            },
            "required": ["session_id", "direction"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let session_id = session_arg(&args)?;
        let direction = str_arg(&args, "direction")?;
        let path = opt_str_arg(&args, "path");

        let (workspace, _) = self.access.resolve(&session_id, path).await?;

        let (files, event_type, operation) = match direction {
            "push" => (
                self.sync.push(&session_id, &workspace, path).await?,
                EventType::FsRead,
                "push",
            ),
            "pull" => (
                self.sync.pull(&session_id, &workspace, path).await?,
                EventType::FsWrite,
                "pull",
            ),
            other => {
                return Err(Error::invalid_request(format!(
                    "direction must be 'push' or 'pull', got '{}'",
                    other
                )))
            }
        };

        self.access
            .audit(&session_id, event_type, fs_payload(path, operation, None, &Ok(())))
            .await;

        Ok(ToolOutput::text(format!("{} {} file(s)", if operation == "push" { "Pushed" } else { "Pulled" }, files))
            .with_data(json!({ "direction": operation, "files": files })))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRuntime, RuntimeCall, ScriptedExec};
    use crate::registry::ContainerRegistry;
    use crate::runtime::ContainerId;
    use agent_sandbox_core::config::SandboxSettings;
    use agent_sandbox_core::mocks::CollectingEventEmitter;

    struct Fixture {
        runtime: Arc<MockRuntime>,
        executor: Arc<CommandExecutor>,
        access: Arc<WorkspaceAccess>,
        emitter: Arc<CollectingEventEmitter>,
        _base: tempfile::TempDir,
    }

    fn fixture_with(runtime: MockRuntime) -> Fixture {
        let runtime = Arc::new(runtime);
        let registry = Arc::new(ContainerRegistry::new(
            runtime.clone(),
            SandboxSettings::default(),
        ));
        let base = tempfile::tempdir().unwrap();
        let emitter = Arc::new(CollectingEventEmitter::new());
        let access = Arc::new(
            WorkspaceAccess::new(Arc::new(WorkspaceManager::new(base.path(), "test-ws")))
                .with_event_emitter(emitter.clone()),
        );
        Fixture {
            runtime,
            executor: Arc::new(CommandExecutor::new(registry)),
            access,
            emitter,
            _base: base,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockRuntime::new())
    }

    #[tokio::test]
    async fn test_shell_tool_success() {
        let f = fixture();
        f.runtime.push_exec(ScriptedExec::ok("Hello Sandbox\n"));
        let tool = SandboxShellTool::new(f.executor.clone());

        let result = tool
            .execute(json!({"session_id": "s1", "command": "echo Hello Sandbox"}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.content.contains("Hello Sandbox"));
        assert_eq!(result.data.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_shell_tool_failure() {
        let f = fixture();
        f.runtime
            .push_exec(ScriptedExec::exit(1, "", "command not found"));
        let tool = SandboxShellTool::new(f.executor.clone());

        let result = tool
            .execute(json!({"session_id": "s1", "command": "nonexistent_command"}))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.content.contains("exit code 1"));
        assert!(result.content.contains("command not found"));
    }

    #[tokio::test]
    async fn test_shell_tool_requires_session() {
        let f = fixture();
        let tool = SandboxShellTool::new(f.executor.clone());

        let err = tool.execute(json!({"command": "ls"})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_shell_tool_retries_unavailable_once() {
        let f = fixture();
        f.runtime.fail_next_creates(1);
        let tool = SandboxShellTool::new(f.executor.clone());

        let result = tool
            .execute(json!({"session_id": "s1", "command": "true"}))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(f.runtime.create_count(), 2);
    }

    #[tokio::test]
    async fn test_shell_tool_gives_up_after_retry() {
        let f = fixture();
        f.runtime.set_fail_create(true);
        let tool = SandboxShellTool::new(f.executor.clone());

        let err = tool
            .execute(json!({"session_id": "s1", "command": "true"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SandboxUnavailable(_)));
        assert_eq!(f.runtime.create_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_tool_timeout_resets_sandbox() {
        let f = fixture_with(MockRuntime::new());
        let session = SessionId::from("s1");
        f.executor.registry().get_or_create(&session).await.unwrap();
        f.runtime.push_exec(ScriptedExec::still_running("spinning"));

        // Exit settle window longer than the tool timeout
        let executor = Arc::new(
            CommandExecutor::new(f.executor.registry().clone())
                .with_exit_settle(Duration::from_secs(600)),
        );
        let tool = SandboxShellTool::new(executor.clone());

        let result = tool
            .execute(json!({"session_id": "s1", "command": "sleep 999", "timeout_secs": 1}))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.content.contains("timed out"));
        assert!(!executor.registry().contains(&session));
        assert!(f
            .runtime
            .calls()
            .iter()
            .any(|c| matches!(c, RuntimeCall::RemoveContainer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_tool_timeout_during_creation_removes_container() {
        let f = fixture_with(MockRuntime::new().with_start_delay(Duration::from_secs(60)));
        let session = SessionId::from("s1");
        let tool = SandboxShellTool::new(f.executor.clone());

        let result = tool
            .execute(json!({"session_id": "s1", "command": "true", "timeout_secs": 1}))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.data.as_ref().unwrap()["timed_out"], true);
        assert_eq!(f.runtime.create_count(), 1);
        assert!(!f.executor.registry().contains(&session));

        // The container created behind the timeout was torn down, not leaked
        let id = ContainerId("mock-container-0".to_string());
        let calls = f.runtime.calls_for(&id);
        assert_eq!(
            &calls[calls.len() - 2..],
            &[
                RuntimeCall::StopContainer(id.clone()),
                RuntimeCall::RemoveContainer(id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_and_read_file() {
        let f = fixture();
        let write_tool = WorkspaceWriteFileTool::new(f.access.clone());
        let read_tool = WorkspaceReadFileTool::new(f.access.clone());

        let w_result = write_tool
            .execute(json!({"session_id": "s1", "path": "src/hello.txt", "content": "Hello World"}))
            .await
            .unwrap();
        assert!(w_result.success);

        let r_result = read_tool
            .execute(json!({"session_id": "s1", "path": "./src/hello.txt"}))
            .await
            .unwrap();
        assert_eq!(r_result.content, "Hello World");

        assert_eq!(f.emitter.count(&EventType::FsWrite), 1);
        assert_eq!(f.emitter.count(&EventType::FsRead), 1);
    }

    #[tokio::test]
    async fn test_sessions_have_separate_workspaces() {
        let f = fixture();
        let write_tool = WorkspaceWriteFileTool::new(f.access.clone());
        let read_tool = WorkspaceReadFileTool::new(f.access.clone());

        write_tool
            .execute(json!({"session_id": "a", "path": "secret.txt", "content": "a's data"}))
            .await
            .unwrap();

        let err = read_tool
            .execute(json!({"session_id": "b", "path": "secret.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_write_file_path_traversal() {
        let f = fixture();
        let tool = WorkspaceWriteFileTool::new(f.access.clone());

        let err = tool
            .execute(json!({"session_id": "s1", "path": "../../../etc/passwd", "content": "evil"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SecurityViolation(_)));
        assert!(err.to_string().contains("path traversal"));
        assert_eq!(f.emitter.count(&EventType::SecurityViolation), 1);
    }

    #[tokio::test]
    async fn test_read_file_absolute_path() {
        let f = fixture();
        let tool = WorkspaceReadFileTool::new(f.access.clone());

        let err = tool
            .execute(json!({"session_id": "s1", "path": "/etc/passwd"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SecurityViolation(_)));
        assert!(err.to_string().contains("forbidden request"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_through_symlink_is_rejected() {
        let f = fixture();
        let ws = f.access.workspaces().open(&"s1".into()).await.unwrap();
        std::os::unix::fs::symlink("/etc", ws.root().join("etc")).unwrap();

        let tool = WorkspaceReadFileTool::new(f.access.clone());
        let err = tool
            .execute(json!({"session_id": "s1", "path": "etc/hostname"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn test_list_files() {
        let f = fixture();
        let write_tool = WorkspaceWriteFileTool::new(f.access.clone());
        for path in ["b.txt", "a.txt", "src/lib.rs"] {
            write_tool
                .execute(json!({"session_id": "s1", "path": path, "content": "x"}))
                .await
                .unwrap();
        }

        let tool = WorkspaceListFilesTool::new(f.access.clone());
        let result = tool.execute(json!({"session_id": "s1"})).await.unwrap();
        assert_eq!(result.content, "a.txt\nb.txt\nsrc/");
    }

    #[tokio::test]
    async fn test_search_finds_lines_and_truncates() {
        let f = fixture();
        let write_tool = WorkspaceWriteFileTool::new(f.access.clone());
        write_tool
            .execute(json!({
                "session_id": "s1",
                "path": "src/main.rs",
                "content": "fn main() {\n    todo!()\n}\nfn helper() {}\n"
            }))
            .await
            .unwrap();

        let tool = WorkspaceSearchTool::new(f.access.clone());
        let result = tool
            .execute(json!({"session_id": "s1", "pattern": r"^fn \w+"}))
            .await
            .unwrap();
        assert_eq!(result.content, "src/main.rs:1: fn main() {\nsrc/main.rs:4: fn helper() {}");

        let limited = tool
            .execute(json!({"session_id": "s1", "pattern": "fn", "max_results": 1}))
            .await
            .unwrap();
        assert_eq!(limited.data.unwrap()["truncated"], true);
    }

    #[tokio::test]
    async fn test_search_invalid_pattern() {
        let f = fixture();
        let tool = WorkspaceSearchTool::new(f.access.clone());
        let err = tool
            .execute(json!({"session_id": "s1", "pattern": "("}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_sync_push_uploads_archive() {
        let f = fixture();
        let write_tool = WorkspaceWriteFileTool::new(f.access.clone());
        write_tool
            .execute(json!({"session_id": "s1", "path": "app/main.py", "content": "print(1)"}))
            .await
            .unwrap();

        let sync = Arc::new(ArchiveSync::new(f.executor.registry().clone()));
        let tool = SandboxSyncTool::new(sync, f.access.clone());
        let result = tool
            .execute(json!({"session_id": "s1", "direction": "push", "path": "app"}))
            .await
            .unwrap();

        assert_eq!(result.data.unwrap()["files"], 1);
        assert!(f.runtime.archive("/workspace").is_some());
    }

    #[tokio::test]
    async fn test_sync_rejects_unknown_direction() {
        let f = fixture();
        let sync = Arc::new(ArchiveSync::new(f.executor.registry().clone()));
        let tool = SandboxSyncTool::new(sync, f.access.clone());

        let err = tool
            .execute(json!({"session_id": "s1", "direction": "sideways"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
