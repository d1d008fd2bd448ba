//! Audit events emitted by the sandbox components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit record. Sinks receive it through [`crate::traits::EventEmitter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    /// Session the event belongs to; `None` for process-wide events.
    pub session_id: Option<String>,
    /// Component or tool that raised the event.
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: EventSeverity,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            actor: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Container created and started for a session
    SandboxCreated,
    /// Container stopped and removed
    SandboxDestroyed,
    /// Command finished inside a container
    ToolExecFinished,
    /// Workspace directory allocated
    WorkspaceCreated,
    /// Workspace directory removed
    WorkspaceRemoved,
    /// Filesystem read operation
    FsRead,
    /// Filesystem write operation
    FsWrite,
    /// Rejected path traversal or escape attempt
    SecurityViolation,
    /// Generic/Other event
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Payload of `SandboxCreated` / `SandboxDestroyed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLifecyclePayload {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// One of `created`, `explicit`, `idle`, `shutdown`.
    pub reason: String,
}

/// Payload of `ToolExecFinished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecPayload {
    pub tool_name: String,
    pub input: Option<serde_json::Value>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Payload of `FsRead` / `FsWrite`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsPayload {
    /// Virtual path as the agent supplied it.
    pub path: String,
    /// `read`, `write`, `list`, `search`, `push` or `pull`.
    pub operation: String,
    pub size_bytes: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}
