use serde::{Deserialize, Serialize};

use super::SessionId;

/// A command to run inside a session's sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub session_id: SessionId,
    pub command: String,
    /// Extra environment variables, `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,
    /// Allocate a pseudo-terminal. Output is then a raw stream on stdout.
    #[serde(default)]
    pub tty: bool,
}

impl ExecRequest {
    pub fn new(session_id: impl Into<SessionId>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            env: Vec::new(),
            tty: false,
        }
    }
}

/// Captured output of a single command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process had not terminated when output was collected.
    pub exit_code: Option<i64>,
}

impl ExecResult {
    /// Whether the process is known to have exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
