//! In-memory mock runtime for testing without Docker.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agent_sandbox_core::{Error, Result};

use crate::demux::{encode_frame, StreamKind};
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ExecId, ExecOutput, ExecSpec, ExecState,
    TerminalSize,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A runtime call as observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    CreateContainer { name: String, image: String },
    StartContainer(ContainerId),
    CreateExec { container: ContainerId, cmd: Vec<String> },
    StartExec(ExecId),
    InspectExec(ExecId),
    ResizeExec(ExecId, TerminalSize),
    StopContainer(ContainerId),
    RemoveContainer(ContainerId),
    PutArchive { container: ContainerId, path: String },
    GetArchive { container: ContainerId, path: String },
}

/// Scripted behaviour for the next exec session.
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Inspect calls that report "running" before the exit code shows up.
    pub running_polls: usize,
    /// Raw wire bytes to send instead of encoded stdout/stderr.
    pub raw: Option<Bytes>,
}

impl ScriptedExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(code),
            running_polls: 0,
            raw: None,
        }
    }

    /// Process that never reports termination.
    pub fn still_running(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            running_polls: usize::MAX,
            ..Self::ok(stdout)
        }
    }

    /// Send `raw` as-is on the exec stream.
    pub fn malformed(raw: impl Into<Bytes>) -> Self {
        Self {
            raw: Some(raw.into()),
            ..Self::ok("")
        }
    }

    pub fn with_running_polls(mut self, polls: usize) -> Self {
        self.running_polls = polls;
        self
    }
}

/// Mock runtime that records every call.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    scripts: Mutex<VecDeque<ScriptedExec>>,
    execs: Mutex<HashMap<String, (ScriptedExec, usize)>>,
    archives: Mutex<HashMap<String, Bytes>>,
    create_delay: Option<Duration>,
    start_delay: Option<Duration>,
    next_id: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_exec_create: AtomicBool,
    fail_remove: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make container creation take `delay`, widening race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make `start_container` take `delay` after the container exists.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Queue the behaviour of the next exec session.
    pub fn push_exec(&self, script: ScriptedExec) {
        lock(&self.scripts).push_back(script);
    }

    pub fn set_fail_create(&self, fail: bool) {
        let n = if fail { usize::MAX } else { 0 };
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Fail only the next `n` container creations.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_exec_create(&self, fail: bool) {
        self.fail_exec_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Seed an archive returned by `get_archive` for `path`.
    pub fn insert_archive(&self, path: impl Into<String>, tar: Bytes) {
        lock(&self.archives).insert(path.into(), tar);
    }

    /// Archive last uploaded to `path`.
    pub fn archive(&self, path: &str) -> Option<Bytes> {
        lock(&self.archives).get(path).cloned()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RuntimeCall::CreateContainer { .. }))
            .count()
    }

    /// Calls that targeted container `id`, in order.
    pub fn calls_for(&self, id: &ContainerId) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                RuntimeCall::StartContainer(c)
                | RuntimeCall::StopContainer(c)
                | RuntimeCall::RemoveContainer(c) => c == id,
                RuntimeCall::CreateExec { container, .. }
                | RuntimeCall::PutArchive { container, .. }
                | RuntimeCall::GetArchive { container, .. } => container == id,
                _ => false,
            })
            .collect()
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.record(RuntimeCall::CreateContainer {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.fail_creates.load(Ordering::SeqCst);
        if failing > 0 {
            if failing != usize::MAX {
                self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(Error::sandbox_unavailable("mock: image not found"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerId(format!("mock-container-{}", n)))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.record(RuntimeCall::StartContainer(id.clone()));
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn create_exec(&self, id: &ContainerId, spec: &ExecSpec) -> Result<ExecId> {
        self.record(RuntimeCall::CreateExec {
            container: id.clone(),
            cmd: spec.cmd.clone(),
        });
        if self.fail_exec_create.load(Ordering::SeqCst) {
            return Err(Error::command_rejected("mock: container is not running"));
        }

        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| ScriptedExec::ok("[mock] command executed"));
        let exec_id = format!("mock-exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let polls = script.running_polls;
        lock(&self.execs).insert(exec_id.clone(), (script, polls));
        Ok(ExecId(exec_id))
    }

    async fn start_exec(&self, exec: &ExecId, _tty: bool) -> Result<ExecOutput> {
        self.record(RuntimeCall::StartExec(exec.clone()));
        let script = lock(&self.execs)
            .get(&exec.0)
            .map(|(s, _)| s.clone())
            .ok_or_else(|| Error::transport(format!("mock: no such exec {}", exec)))?;

        let chunks: Vec<Result<Bytes>> = match script.raw {
            Some(raw) => vec![Ok(raw)],
            None => {
                let mut chunks = Vec::new();
                if !script.stdout.is_empty() {
                    chunks.push(Ok(encode_frame(StreamKind::Stdout, script.stdout.as_bytes())));
                }
                if !script.stderr.is_empty() {
                    chunks.push(Ok(encode_frame(StreamKind::Stderr, script.stderr.as_bytes())));
                }
                chunks
            }
        };
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn inspect_exec(&self, exec: &ExecId) -> Result<ExecState> {
        self.record(RuntimeCall::InspectExec(exec.clone()));
        let mut execs = lock(&self.execs);
        let (script, polls_left) = execs
            .get_mut(&exec.0)
            .ok_or_else(|| Error::transport(format!("mock: no such exec {}", exec)))?;

        if *polls_left > 0 {
            *polls_left = polls_left.saturating_sub(1);
            return Ok(ExecState {
                running: true,
                exit_code: None,
            });
        }
        Ok(ExecState {
            running: false,
            exit_code: script.exit_code,
        })
    }

    async fn resize_exec(&self, exec: &ExecId, size: TerminalSize) -> Result<()> {
        self.record(RuntimeCall::ResizeExec(exec.clone(), size));
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, _grace: Duration) -> Result<()> {
        self.record(RuntimeCall::StopContainer(id.clone()));
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, _force: bool) -> Result<()> {
        self.record(RuntimeCall::RemoveContainer(id.clone()));
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::transport("mock: daemon hung up"));
        }
        Ok(())
    }

    async fn put_archive(&self, id: &ContainerId, path: &str, tar: Bytes) -> Result<()> {
        self.record(RuntimeCall::PutArchive {
            container: id.clone(),
            path: path.to_string(),
        });
        lock(&self.archives).insert(path.to_string(), tar);
        Ok(())
    }

    async fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes> {
        self.record(RuntimeCall::GetArchive {
            container: id.clone(),
            path: path.to_string(),
        });
        self.archive(path)
            .ok_or_else(|| Error::transport(format!("mock: no archive at {}", path)))
    }

    async fn ping(&self) -> bool {
        true
    }
}
