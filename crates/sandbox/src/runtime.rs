//! Container runtime abstraction.
//!
//! The registry and executor talk to containers only through [`ContainerRuntime`].
//! [`crate::docker::DockerRuntime`] implements it on top of `bollard`;
//! [`crate::mock::MockRuntime`] records calls for tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use agent_sandbox_core::config::SandboxSettings;
use agent_sandbox_core::Result;

// =============================================================================
// Runtime Types
// =============================================================================

/// Identifier of a container, as assigned by the runtime.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an exec session inside a container.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecId(pub String);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to create a session container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Long-running entrypoint that keeps the container alive between execs.
    pub command: Vec<String>,
    pub workdir: String,
    pub user: Option<String>,
    pub memory_limit_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Build the spec for a session's container from configuration.
    pub fn for_session(settings: &SandboxSettings, session_id: &str) -> Self {
        let mut labels = settings.labels.clone();
        labels.insert("agent-sandbox.session".to_string(), session_id.to_string());

        Self {
            name: format!("agent-sandbox-{}", uuid::Uuid::new_v4()),
            image: settings.image.clone(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            workdir: settings.workdir.clone(),
            user: settings.user.clone(),
            memory_limit_bytes: settings.memory_limit_bytes,
            cpu_quota: settings.cpu_quota,
            pids_limit: settings.pids_limit,
            network_mode: settings.network_mode.clone(),
            labels,
        }
    }
}

/// Parameters of a single exec session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub workdir: String,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub tty: bool,
}

/// State reported by exec inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecState {
    pub running: bool,
    /// Absent while the process is still running.
    pub exit_code: Option<i64>,
}

/// Terminal dimensions for interactive execs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Multiplexed output of a started exec, in Docker attach framing.
pub type ExecOutput = BoxStream<'static, Result<Bytes>>;

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Operations consumed from the container runtime.
///
/// Implementations map failures onto the error taxonomy: container create and
/// start fail with `SandboxUnavailable`, exec creation with `CommandRejected`,
/// everything else with `Transport`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container. Auto-remove must stay disabled.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Start a created container.
    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Create an exec session with stdout and stderr attached.
    async fn create_exec(&self, id: &ContainerId, spec: &ExecSpec) -> Result<ExecId>;

    /// Start an exec session and hand back its multiplexed output stream.
    async fn start_exec(&self, exec: &ExecId, tty: bool) -> Result<ExecOutput>;

    /// Inspect an exec session for its exit code.
    async fn inspect_exec(&self, exec: &ExecId) -> Result<ExecState>;

    /// Resize the pseudo-terminal of an exec session.
    async fn resize_exec(&self, exec: &ExecId, size: TerminalSize) -> Result<()>;

    /// Stop a container, killing it after `grace`.
    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<()>;

    /// Remove a container. Removing an unknown container succeeds.
    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Extract a tar archive into `path` inside the container.
    async fn put_archive(&self, id: &ContainerId, path: &str, tar: Bytes) -> Result<()>;

    /// Fetch `path` from the container as a tar archive.
    async fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes>;

    /// Check if the runtime is reachable.
    async fn ping(&self) -> bool;
}
