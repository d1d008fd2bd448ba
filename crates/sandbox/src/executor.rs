//! Command execution inside session containers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_sandbox_core::events::{EventEnvelope, EventSeverity, EventType, ToolExecPayload};
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_core::types::{ExecRequest, ExecResult};
use agent_sandbox_core::{Error, Result};

use crate::demux::demultiplex;
use crate::registry::{ContainerLease, ContainerRegistry};
use crate::runtime::{ContainerRuntime, ExecId, ExecOutput, ExecSpec, TerminalSize};

/// Delay between exec inspect polls while waiting for the exit code.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs shell commands in the session's container and collects their output.
pub struct CommandExecutor {
    registry: Arc<ContainerRegistry>,
    shell: Vec<String>,
    exit_settle: Duration,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        let exit_settle = registry.settings().exit_settle();
        Self {
            registry,
            shell: vec!["sh".to_string(), "-c".to_string()],
            exit_settle,
            event_emitter: None,
        }
    }

    /// Set an event emitter for auditing.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    /// Override how long to wait for the exit code after output drains.
    pub fn with_exit_settle(mut self, settle: Duration) -> Self {
        self.exit_settle = settle;
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// Run `request.command` to completion.
    ///
    /// A non-zero exit is a successful call; only failures to run the command
    /// or to read its output are errors. The container stays registered
    /// whatever happens here.
    pub async fn exec_command(&self, request: &ExecRequest) -> Result<ExecResult> {
        let started = Instant::now();
        let outcome = match self.start(request).await {
            Ok(running) => running.wait().await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        let status = match &outcome {
            Ok(result) if result.success() => "success",
            Ok(_) => "nonzero",
            Err(e) => e.code(),
        };
        metrics::counter!("sandbox_exec_total", "status" => status).increment(1);
        metrics::histogram!("sandbox_exec_duration_seconds").record(elapsed.as_secs_f64());

        match &outcome {
            Ok(result) => tracing::debug!(
                session_id = %request.session_id,
                exit_code = ?result.exit_code,
                stdout_len = result.stdout.len(),
                stderr_len = result.stderr.len(),
                duration_ms = elapsed.as_millis() as u64,
                "Command finished"
            ),
            Err(e) => tracing::warn!(
                session_id = %request.session_id,
                error = %e,
                "Command failed"
            ),
        }

        self.emit(request, &outcome, elapsed).await;
        outcome
    }

    /// Start `request.command` and return a handle to the running process.
    ///
    /// The container is pinned until the handle is waited on or dropped.
    pub async fn start(&self, request: &ExecRequest) -> Result<RunningExec> {
        if request.command.trim().is_empty() {
            return Err(Error::command_rejected("command must not be empty"));
        }

        let lease = self.registry.lease(&request.session_id).await?;
        let runtime = self.registry.runtime().clone();
        let settings = self.registry.settings();

        let mut cmd = self.shell.clone();
        cmd.push(request.command.clone());
        let spec = ExecSpec {
            cmd,
            workdir: settings.workdir.clone(),
            user: settings.user.clone(),
            env: request.env.clone(),
            tty: request.tty,
        };

        let exec_id = runtime.create_exec(lease.container_id(), &spec).await?;
        let output = runtime.start_exec(&exec_id, request.tty).await?;

        Ok(RunningExec {
            runtime,
            exec_id,
            tty: request.tty,
            output,
            exit_settle: self.exit_settle,
            _lease: lease,
        })
    }

    async fn emit(&self, request: &ExecRequest, outcome: &Result<ExecResult>, elapsed: Duration) {
        let Some(ref emitter) = self.event_emitter else {
            return;
        };

        let (exit_code, error, severity) = match outcome {
            Ok(result) => (result.exit_code, None, EventSeverity::Info),
            Err(e) => (None, Some(e.to_string()), EventSeverity::Warning),
        };
        let payload = ToolExecPayload {
            tool_name: "exec".to_string(),
            input: Some(serde_json::json!({ "command": request.command })),
            exit_code,
            duration_ms: Some(elapsed.as_millis() as u64),
            error,
        };

        emitter
            .emit(
                EventEnvelope::new(
                    EventType::ToolExecFinished,
                    serde_json::to_value(payload).unwrap_or_default(),
                )
                .with_session(request.session_id.as_str())
                .with_actor("command-executor")
                .with_severity(severity),
            )
            .await;
    }
}

/// A started exec session.
pub struct RunningExec {
    runtime: Arc<dyn ContainerRuntime>,
    exec_id: ExecId,
    tty: bool,
    output: ExecOutput,
    exit_settle: Duration,
    _lease: ContainerLease,
}

impl RunningExec {
    pub fn exec_id(&self) -> &ExecId {
        &self.exec_id
    }

    /// Forward a terminal resize. No-op for non-interactive execs.
    pub async fn resize(&self, size: TerminalSize) -> Result<()> {
        if !self.tty {
            return Ok(());
        }
        self.runtime.resize_exec(&self.exec_id, size).await
    }

    /// Drain the output and collect the exit code.
    pub async fn wait(self) -> Result<ExecResult> {
        let output = demultiplex(self.output).await?;
        let exit_code = wait_for_exit(self.runtime.as_ref(), &self.exec_id, self.exit_settle).await?;

        Ok(ExecResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }
}

/// Poll exec inspect until the process is reported stopped or `settle` runs out.
///
/// The output stream can close a moment before the daemon records the exit
/// code, so a single inspect right after draining may still say "running".
async fn wait_for_exit(
    runtime: &dyn ContainerRuntime,
    exec_id: &ExecId,
    settle: Duration,
) -> Result<Option<i64>> {
    let deadline = tokio::time::Instant::now() + settle;
    loop {
        let state = runtime.inspect_exec(exec_id).await?;
        if !state.running {
            return Ok(state.exit_code);
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::debug!(exec_id = %exec_id, "Exec still running after output closed");
            return Ok(None);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRuntime, RuntimeCall, ScriptedExec};
    use agent_sandbox_core::config::SandboxSettings;
    use agent_sandbox_core::mocks::CollectingEventEmitter;
    use agent_sandbox_core::types::SessionId;

    fn executor(runtime: Arc<MockRuntime>) -> CommandExecutor {
        let registry = Arc::new(ContainerRegistry::new(runtime, SandboxSettings::default()));
        CommandExecutor::new(registry)
    }

    #[tokio::test]
    async fn test_exec_splits_streams_and_reports_exit() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.push_exec(ScriptedExec::exit(0, "hello\n", "oops\n"));
        let executor = executor(runtime.clone());

        let result = executor
            .exec_command(&ExecRequest::new("s1", "echo hello; echo oops >&2"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, Some(0));

        let exec_cmd = runtime.calls().into_iter().find_map(|c| match c {
            RuntimeCall::CreateExec { cmd, .. } => Some(cmd),
            _ => None,
        });
        assert_eq!(
            exec_cmd.unwrap(),
            vec!["sh", "-c", "echo hello; echo oops >&2"]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.push_exec(ScriptedExec::exit(127, "", "sh: nope: not found\n"));
        let executor = executor(runtime);

        let result = executor
            .exec_command(&ExecRequest::new("s1", "nope"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(127));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(runtime.clone());

        let err = executor
            .exec_command(&ExecRequest::new("s1", "   "))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandRejected(_)));
        assert_eq!(runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_code_settles_after_running_polls() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.push_exec(ScriptedExec::exit(3, "done", "").with_running_polls(2));
        let executor = executor(runtime);

        let result = executor
            .exec_command(&ExecRequest::new("s1", "exit 3"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_running_yields_unknown_exit_code() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.push_exec(ScriptedExec::still_running("partial"));
        let executor = executor(runtime);

        let result = executor
            .exec_command(&ExecRequest::new("s1", "sleep 100 &"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "partial");
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_malformed_stream_is_decode_error_and_keeps_container() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.push_exec(ScriptedExec::malformed(vec![9u8, 0, 0, 0, 0, 0, 0, 0]));
        let executor = executor(runtime.clone());
        let session = SessionId::from("s1");

        let err = executor
            .exec_command(&ExecRequest::new(session.clone(), "cat /dev/urandom"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Decode(_)));
        assert!(executor.registry().contains(&session));

        // Container is reused for the next command
        executor
            .exec_command(&ExecRequest::new(session, "true"))
            .await
            .unwrap();
        assert_eq!(runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn test_exec_create_failure_is_command_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_fail_exec_create(true);
        let executor = executor(runtime);

        let err = executor
            .exec_command(&ExecRequest::new("s1", "ls"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandRejected(_)));
    }

    #[tokio::test]
    async fn test_resize_only_for_tty() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(runtime.clone());
        let size = TerminalSize { cols: 120, rows: 40 };

        let plain = executor.start(&ExecRequest::new("s1", "ls")).await.unwrap();
        plain.resize(size).await.unwrap();
        plain.wait().await.unwrap();

        let mut request = ExecRequest::new("s1", "bash");
        request.tty = true;
        let interactive = executor.start(&request).await.unwrap();
        interactive.resize(size).await.unwrap();
        let exec_id = interactive.exec_id().clone();
        interactive.wait().await.unwrap();

        let resizes: Vec<_> = runtime
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RuntimeCall::ResizeExec(..)))
            .collect();
        assert_eq!(resizes, vec![RuntimeCall::ResizeExec(exec_id, size)]);
    }

    #[tokio::test]
    async fn test_exec_emits_audit_event() {
        let runtime = Arc::new(MockRuntime::new());
        let emitter = Arc::new(CollectingEventEmitter::new());
        let executor = executor(runtime).with_event_emitter(emitter.clone());

        executor
            .exec_command(&ExecRequest::new("s1", "true"))
            .await
            .unwrap();

        assert_eq!(emitter.count(&EventType::ToolExecFinished), 1);
    }
}
