//! Ephemeral workspace lifecycle.
//!
//! A workspace is a real directory bound to one session. File tools resolve
//! every virtual path against its root before touching the filesystem.

use dashmap::DashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_sandbox_core::config::WorkspaceSettings;
use agent_sandbox_core::events::{EventEnvelope, EventType};
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_core::types::SessionId;
use agent_sandbox_core::{Error, Result};

use crate::resolver::resolve_virtual_path;

/// Handle to a session's workspace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    session_id: SessionId,
    root: PathBuf,
}

impl Workspace {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path inside this workspace. Performs no I/O.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        resolve_virtual_path(&self.root, virtual_path)
    }

    /// Verifies that `actual` does not leave the root through a symlink.
    ///
    /// Walks up to the nearest existing ancestor, canonicalizes it and checks
    /// it against the canonical root. Call after [`Workspace::resolve`].
    pub async fn ensure_contained(&self, actual: &Path) -> Result<()> {
        let root = tokio::fs::canonicalize(&self.root).await?;
        let mut ancestor = actual.to_path_buf();
        loop {
            match tokio::fs::canonicalize(&ancestor).await {
                Ok(canonical) => {
                    if canonical.starts_with(&root) {
                        return Ok(());
                    }
                    return Err(Error::security(format!(
                        "forbidden request: {} escapes the workspace",
                        actual.display()
                    )));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if !ancestor.pop() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Creates, tracks and removes workspace directories.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    prefix: String,
    active: DashMap<SessionId, Workspace>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl WorkspaceManager {
    /// Create a manager that allocates workspaces under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefix: prefix.into(),
            active: DashMap::new(),
            event_emitter: None,
        }
    }

    pub fn from_settings(settings: &WorkspaceSettings) -> Self {
        Self::new(settings.resolved_base_dir(), settings.prefix.clone())
    }

    /// Set an event emitter for auditing workspace allocation.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Allocate a fresh workspace with a newly generated session ID.
    pub async fn create(&self) -> Result<Workspace> {
        self.create_for(SessionId::generate()).await
    }

    /// Allocate a fresh, uniquely named workspace for `session_id`.
    ///
    /// The directory is not tracked; use [`WorkspaceManager::open`] for the
    /// per-session lazily created workspace.
    pub async fn create_for(&self, session_id: SessionId) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            Error::workspace(format!(
                "Failed to prepare workspace base {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        let root = self
            .base_dir
            .join(format!("{}-{}", self.prefix, uuid::Uuid::new_v4()));

        // create_dir (not create_dir_all) fails if the name is already taken
        tokio::fs::create_dir(&root).await.map_err(|e| {
            Error::workspace(format!(
                "Failed to create workspace {}: {}",
                root.display(),
                e
            ))
        })?;

        tracing::debug!(session_id = %session_id, root = %root.display(), "Workspace created");

        if let Some(ref emitter) = self.event_emitter {
            emitter
                .emit(
                    EventEnvelope::new(
                        EventType::WorkspaceCreated,
                        path_payload(&root),
                    )
                    .with_session(session_id.as_str())
                    .with_actor("workspace-manager"),
                )
                .await;
        }

        Ok(Workspace { session_id, root })
    }

    /// Recursively remove a workspace. Removing an absent workspace is not an error.
    pub async fn cleanup(&self, workspace: &Workspace) -> Result<()> {
        match tokio::fs::remove_dir_all(&workspace.root).await {
            Ok(()) => {
                tracing::debug!(
                    session_id = %workspace.session_id,
                    root = %workspace.root.display(),
                    "Workspace removed"
                );
                if let Some(ref emitter) = self.event_emitter {
                    emitter
                        .emit(
                            EventEnvelope::new(
                                EventType::WorkspaceRemoved,
                                path_payload(&workspace.root),
                            )
                            .with_session(workspace.session_id.as_str())
                            .with_actor("workspace-manager"),
                        )
                        .await;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::workspace(format!(
                "Failed to remove workspace {}: {}",
                workspace.root.display(),
                e
            ))),
        }
    }

    /// Run `f` with a fresh workspace and remove it afterwards, also when `f` fails.
    pub async fn scoped<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Workspace) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let workspace = self.create().await?;
        let outcome = f(workspace.clone()).await;
        let cleaned = self.cleanup(&workspace).await;

        match (outcome, cleaned) {
            (Err(e), Err(cleanup_err)) => {
                tracing::warn!(
                    root = %workspace.root.display(),
                    error = %cleanup_err,
                    "Workspace cleanup failed after tool error"
                );
                Err(e)
            }
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
            (outcome, Ok(())) => outcome,
        }
    }

    /// Get the session's workspace, creating it on first use.
    pub async fn open(&self, session_id: &SessionId) -> Result<Workspace> {
        if let Some(existing) = self.active.get(session_id) {
            return Ok(existing.clone());
        }

        let fresh = self.create_for(session_id.clone()).await?;
        let winner = self
            .active
            .entry(session_id.clone())
            .or_insert_with(|| fresh.clone())
            .clone();

        // Lost the race to a concurrent open; drop our directory
        if winner.root != fresh.root {
            self.cleanup(&fresh).await?;
        }

        Ok(winner)
    }

    /// The session's workspace if one has been opened.
    pub fn get(&self, session_id: &SessionId) -> Option<Workspace> {
        self.active.get(session_id).map(|w| w.clone())
    }

    /// Remove the session's workspace. Returns whether one existed.
    pub async fn release(&self, session_id: &SessionId) -> Result<bool> {
        match self.active.remove(session_id) {
            Some((_, workspace)) => {
                self.cleanup(&workspace).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every tracked workspace, logging individual failures.
    pub async fn release_all(&self) -> usize {
        let sessions: Vec<SessionId> = self.active.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for session_id in sessions {
            match self.release(&session_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to release workspace")
                }
            }
        }
        released
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn path_payload(root: &Path) -> serde_json::Value {
    serde_json::json!({ "root": root.display().to_string() })
}
