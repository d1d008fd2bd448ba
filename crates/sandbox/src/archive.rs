//! Bulk file transfer between a host workspace and a session container.
//!
//! Files move as tar archives through the runtime's archive put/get calls.
//! Packing and unpacking are blocking and run on the blocking pool.

use bytes::Bytes;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_sandbox_core::types::SessionId;
use agent_sandbox_core::{Error, Result};
use agent_sandbox_workspace::{container_path, normalize_virtual_path, resolve_virtual_path, Workspace};

use crate::registry::ContainerRegistry;

/// Copies workspace trees into and out of session containers.
pub struct ArchiveSync {
    registry: Arc<ContainerRegistry>,
}

impl ArchiveSync {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        Self { registry }
    }

    /// Upload `virtual_path` (file or directory, `""` for everything) from
    /// the workspace to the same relative location under the container workdir.
    ///
    /// Returns the number of files sent.
    pub async fn push(&self, session_id: &SessionId, workspace: &Workspace, virtual_path: &str) -> Result<usize> {
        let relative = normalize_virtual_path(virtual_path)?;
        let local = workspace.resolve(virtual_path)?;
        workspace.ensure_contained(&local).await?;
        if !tokio::fs::try_exists(&local).await? {
            return Err(Error::invalid_request(format!(
                "Nothing to push at {}",
                virtual_path
            )));
        }

        let (tar, files) = tokio::task::spawn_blocking(move || pack_path(&local, &relative))
            .await
            .map_err(|e| Error::internal(format!("archive task failed: {}", e)))??;

        let lease = self.registry.lease(session_id).await?;
        let workdir = self.registry.settings().workdir.clone();
        self.registry
            .runtime()
            .put_archive(lease.container_id(), &workdir, tar)
            .await?;

        tracing::info!(session_id = %session_id, path = %virtual_path, files = files, "Pushed workspace files to sandbox");
        Ok(files)
    }

    /// Download `virtual_path` from under the container workdir into the
    /// same relative location of the workspace.
    ///
    /// Every archive entry is resolved against the workspace root. An entry
    /// that would land outside it aborts the pull; links are skipped.
    pub async fn pull(&self, session_id: &SessionId, workspace: &Workspace, virtual_path: &str) -> Result<usize> {
        let relative = normalize_virtual_path(virtual_path)?;
        let workdir = self.registry.settings().workdir.clone();

        // Archive entries are named after the last component of the source
        // path; for the workdir itself, fetch its contents instead.
        let (source, prefix) = if relative.as_os_str().is_empty() {
            (format!("{}/.", workdir.trim_end_matches('/')), PathBuf::new())
        } else {
            let parent = relative.parent().map(Path::to_path_buf).unwrap_or_default();
            (container_path(&workdir, virtual_path)?, parent)
        };

        let lease = self.registry.lease(session_id).await?;
        let tar = self
            .registry
            .runtime()
            .get_archive(lease.container_id(), &source)
            .await?;
        drop(lease);

        let root = workspace.root().to_path_buf();
        let files = tokio::task::spawn_blocking(move || unpack_archive(&root, &prefix, &tar))
            .await
            .map_err(|e| Error::internal(format!("archive task failed: {}", e)))??;

        tracing::info!(session_id = %session_id, path = %virtual_path, files = files, "Pulled sandbox files into workspace");
        Ok(files)
    }
}

/// Tar `local` under the archive name `name`. Symlinks are not followed or stored.
pub fn pack_path(local: &Path, name: &Path) -> Result<(Bytes, usize)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let files = append_tree(&mut builder, local, name)?;
    let data = builder.into_inner()?;
    Ok((Bytes::from(data), files))
}

fn append_tree(builder: &mut tar::Builder<Vec<u8>>, local: &Path, name: &Path) -> Result<usize> {
    let meta = fs::symlink_metadata(local)?;
    if meta.file_type().is_symlink() {
        tracing::debug!(path = %local.display(), "Skipping symlink");
        return Ok(0);
    }

    if meta.is_file() {
        builder.append_path_with_name(local, name)?;
        return Ok(1);
    }

    if !meta.is_dir() {
        return Ok(0);
    }
    if !name.as_os_str().is_empty() {
        builder.append_dir(name, local)?;
    }

    let mut entries: Vec<_> = fs::read_dir(local)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut files = 0;
    for entry in entries {
        files += append_tree(builder, &entry.path(), &name.join(entry.file_name()))?;
    }
    Ok(files)
}

/// Extract `data` into `root`, placing entries under `prefix`.
///
/// Returns the number of regular files written.
pub fn unpack_archive(root: &Path, prefix: &Path, data: &[u8]) -> Result<usize> {
    let canonical_root = fs::canonicalize(root)?;
    let mut archive = tar::Archive::new(Cursor::new(data));
    let mut files = 0;

    for entry in archive
        .entries()
        .map_err(|e| Error::decode(format!("invalid tar archive: {}", e)))?
    {
        let mut entry = entry.map_err(|e| Error::decode(format!("invalid tar entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| Error::decode(format!("invalid tar entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            tracing::debug!(entry = %raw_path, "Skipping link entry");
            continue;
        }

        let relative = normalize_virtual_path(&raw_path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let virtual_path = prefix.join(&relative);
        let dest = resolve_virtual_path(root, &virtual_path.to_string_lossy())?;

        if entry_type.is_dir() {
            fs::create_dir_all(&dest)?;
            ensure_inside(&canonical_root, &dest)?;
            continue;
        }
        if !(entry_type.is_file() || entry_type.is_contiguous()) {
            tracing::debug!(entry = %raw_path, "Skipping special file entry");
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
            ensure_inside(&canonical_root, parent)?;
        }
        if fs::symlink_metadata(&dest).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            return Err(Error::security(format!(
                "forbidden request: {} is a symlink",
                virtual_path.display()
            )));
        }
        entry.unpack(&dest)?;
        files += 1;
    }

    Ok(files)
}

fn ensure_inside(canonical_root: &Path, path: &Path) -> Result<()> {
    if fs::canonicalize(path)?.starts_with(canonical_root) {
        Ok(())
    } else {
        Err(Error::security(format!(
            "forbidden request: {} escapes the workspace",
            path.display()
        )))
    }
}
