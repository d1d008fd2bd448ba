//! Tool registry and default tool set.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use agent_sandbox_core::traits::{EventEmitter, Tool, ToolRegistry};
use agent_sandbox_core::types::{ToolDefinition, ToolOutput};
use agent_sandbox_core::{Error, Result};
use agent_sandbox_workspace::WorkspaceManager;

use crate::archive::ArchiveSync;
use crate::executor::CommandExecutor;
use crate::tools::{
    SandboxShellTool, SandboxSyncTool, WorkspaceAccess, WorkspaceListFilesTool,
    WorkspaceReadFileTool, WorkspaceSearchTool, WorkspaceWriteFileTool,
};

/// Default tool registry using DashMap.
pub struct DefaultToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl DefaultToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Get the number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

impl Default for DefaultToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRegistry for DefaultToolRegistry {
    async fn register(&self, tool: Box<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        tracing::info!(tool = %name, risk = ?tool.risk_level(), "Registering tool");

        if self.tools.contains_key(&name) {
            return Err(Error::Internal(format!(
                "Tool '{}' is already registered",
                name
            )));
        }

        self.tools.insert(name, Arc::from(tool));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ToolDefinition>> {
        let mut definitions: Vec<_> = self
            .tools
            .iter()
            .map(|entry| ToolDefinition {
                name: entry.name().to_string(),
                description: entry.description().to_string(),
                parameters: entry.parameters(),
                risk_level: entry.risk_level(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(definitions)
    }

    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<ToolOutput> {
        // Clone the Arc so no map shard lock is held across the await
        let tool = self
            .tools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::tool_not_found(name))?;

        tracing::debug!(tool = %name, "Executing tool");

        tool.execute(args).await
    }
}

/// Register the shell, workspace file and sync tools on `registry`.
pub async fn register_sandbox_tools(
    registry: &dyn ToolRegistry,
    executor: Arc<CommandExecutor>,
    workspaces: Arc<WorkspaceManager>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
) -> Result<()> {
    let mut access = WorkspaceAccess::new(workspaces);
    if let Some(emitter) = event_emitter {
        access = access.with_event_emitter(emitter);
    }
    let access = Arc::new(access);
    let sync = Arc::new(ArchiveSync::new(executor.registry().clone()));

    registry
        .register(Box::new(SandboxShellTool::new(executor)))
        .await?;
    registry
        .register(Box::new(WorkspaceWriteFileTool::new(access.clone())))
        .await?;
    registry
        .register(Box::new(WorkspaceReadFileTool::new(access.clone())))
        .await?;
    registry
        .register(Box::new(WorkspaceListFilesTool::new(access.clone())))
        .await?;
    registry
        .register(Box::new(WorkspaceSearchTool::new(access.clone())))
        .await?;
    registry
        .register(Box::new(SandboxSyncTool::new(sync, access)))
        .await?;

    Ok(())
}
