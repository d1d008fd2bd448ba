//! Tool traits.

use crate::error::Result;
use crate::types::{ToolDefinition, ToolOutput, ToolRiskLevel};
use async_trait::async_trait;
use serde_json::Value;

/// Tool interface invoked by the tool-calling harness.
///
/// Arguments come straight from model output and are untrusted.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the unique name of the tool.
    fn name(&self) -> &str;

    /// Get the human-readable description.
    fn description(&self) -> &str;

    /// Get the JSON Schema for parameters.
    fn parameters(&self) -> Value;

    /// Risk classification used by approval layers.
    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Low
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value) -> Result<ToolOutput>;
}

/// Tool registry for managing available tools.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Register a new tool.
    async fn register(&self, tool: Box<dyn Tool>) -> Result<()>;

    /// List all available tools.
    async fn list(&self) -> Result<Vec<ToolDefinition>>;

    /// Execute a tool by name with arguments.
    async fn execute(&self, name: &str, args: Value) -> Result<ToolOutput>;
}
