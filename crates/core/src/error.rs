//! Error types for the agent sandbox.

use thiserror::Error;

/// Result type alias using the sandbox Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the agent sandbox.
///
/// A non-zero exit code from a sandboxed command is never an error; it is
/// returned as data in [`crate::types::ExecResult`].
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Isolation Errors
    // =========================================================================
    /// Path traversal or escape attempt. Raised before any I/O, never retried.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // =========================================================================
    // Execution Plane Errors
    // =========================================================================
    /// The container could not be created or started.
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The runtime refused to create the exec session.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// The multiplexed output stream violated the framing protocol.
    #[error("Stream decode error: {0}")]
    Decode(String),

    /// Communication with the container runtime failed.
    #[error("Runtime transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Tool Layer Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a security violation error.
    pub fn security(msg: impl Into<String>) -> Self {
        Self::SecurityViolation(msg.into())
    }

    /// Create a sandbox unavailable error.
    pub fn sandbox_unavailable(msg: impl Into<String>) -> Self {
        Self::SandboxUnavailable(msg.into())
    }

    /// Create a command rejected error.
    pub fn command_rejected(msg: impl Into<String>) -> Self {
        Self::CommandRejected(msg.into())
    }

    /// Create a stream decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a runtime transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a tool not found error.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    /// Create a workspace error.
    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SecurityViolation(_) => "SECURITY_VIOLATION",
            Self::SandboxUnavailable(_) => "SANDBOX_UNAVAILABLE",
            Self::CommandRejected(_) => "COMMAND_REJECTED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::Workspace(_) | Self::Io(_) => "WORKSPACE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the operation once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable(_))
    }
}
