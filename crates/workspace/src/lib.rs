//! Workspace isolation for file-oriented agent tools.
//!
//! Maps agent-visible ("virtual") paths onto a per-session directory and
//! rejects traversal and escape attempts before any filesystem call.
//!
//! ```ignore
//! let manager = WorkspaceManager::new(std::env::temp_dir(), "agent-ws");
//! let ws = manager.create().await?;
//! let actual = resolve_virtual_path(ws.root(), "./foo/bar.txt")?; // <root>/foo/bar.txt
//! manager.cleanup(&ws).await?;
//! ```

pub mod lifecycle;
pub mod resolver;

pub use lifecycle::{Workspace, WorkspaceManager};
pub use resolver::{container_path, normalize_virtual_path, resolve_virtual_path, to_virtual_path};
