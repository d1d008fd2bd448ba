//! Per-session container execution for agent tools.
//!
//! Each agent session gets at most one long-running container. Commands run
//! in it through exec sessions whose multiplexed output is split back into
//! stdout and stderr. Idle containers are reaped in the background.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Tools (sandbox_shell, workspace_*)    │
//! │    ↓ exec_command / archive sync       │
//! ├────────────────────────────────────────┤
//! │  CommandExecutor   ArchiveSync         │
//! │    ↓ lease(session)                    │
//! ├────────────────────────────────────────┤
//! │  ContainerRegistry  ←  IdleReaper      │
//! │    ↓ ContainerRuntime                  │
//! ├────────────────────────────────────────┤
//! │  DockerRuntime (bollard) / MockRuntime │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agent_sandbox::{CommandExecutor, ContainerRegistry, DockerRuntime, IdleReaper};
//!
//! let runtime = Arc::new(DockerRuntime::new()?);
//! let registry = Arc::new(ContainerRegistry::new(runtime, settings.sandbox.clone()));
//! let executor = CommandExecutor::new(registry.clone());
//!
//! let result = executor.exec_command(&ExecRequest::new("session-1", "ls -la")).await?;
//! let reaper = Arc::new(IdleReaper::from_registry(registry)).spawn(Duration::from_secs(60));
//! ```

pub mod archive;
pub mod demux;
pub mod docker;
pub mod executor;
pub mod mock;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod toolbox;
pub mod tools;

pub use archive::ArchiveSync;
pub use demux::{demultiplex, DemuxedOutput, Demultiplexer, FrameDecoder, StreamKind};
pub use docker::DockerRuntime;
pub use executor::{CommandExecutor, RunningExec};
pub use mock::{MockRuntime, RuntimeCall, ScriptedExec};
pub use reaper::{IdleReaper, ReaperHandle};
pub use registry::{ContainerHandle, ContainerLease, ContainerRegistry, EntryInfo};
pub use runtime::{ContainerId, ContainerRuntime, ContainerSpec, ExecId, ExecSpec, ExecState, TerminalSize};
pub use toolbox::{register_sandbox_tools, DefaultToolRegistry};
pub use tools::{
    SandboxShellTool, SandboxSyncTool, WorkspaceAccess, WorkspaceListFilesTool,
    WorkspaceReadFileTool, WorkspaceSearchTool, WorkspaceWriteFileTool,
};
