//! Virtual path resolution.
//!
//! Every path an agent hands to a file tool is a *virtual* path: a relative
//! location inside the session's workspace root. Resolution is pure string and
//! path-component work and never touches the filesystem, so it can run before
//! any I/O is attempted.

use std::path::{Path, PathBuf};

use agent_sandbox_core::{Error, Result};

/// Normalizes a virtual path into a relative path with no `.`/`..`/empty segments.
///
/// Either separator style is accepted. Absolute paths, drive prefixes, NUL
/// bytes and any `..` segment are rejected with a security error, regardless
/// of whether the `..` would stay inside the root after collapsing.
pub fn normalize_virtual_path(input: &str) -> Result<PathBuf> {
    if input.contains('\0') {
        return Err(Error::security(format!(
            "forbidden request: NUL byte in path {:?}",
            input
        )));
    }

    // Reject Windows-style absolute paths on any OS
    let bytes = input.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(Error::security(format!(
            "forbidden request: absolute path {}",
            input
        )));
    }

    let canonical = input.replace('\\', "/");
    if canonical.starts_with('/') {
        return Err(Error::security(format!(
            "forbidden request: absolute path {}",
            input
        )));
    }

    let mut normalized = PathBuf::new();
    for segment in canonical.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(Error::security(format!(
                    "path traversal detected in path: {}",
                    input
                )));
            }
            other => normalized.push(other),
        }
    }

    Ok(normalized)
}

/// Resolves a virtual path to a concrete location under `root`.
///
/// The result is checked component-wise against `root`, so a sibling such as
/// `/tmp/ws-evil` never passes for a root of `/tmp/ws`.
pub fn resolve_virtual_path(root: &Path, input: &str) -> Result<PathBuf> {
    let relative = normalize_virtual_path(input)?;
    let full_path = root.join(&relative);

    if !full_path.starts_with(root) {
        return Err(Error::security(format!(
            "forbidden request: {} is outside of {}",
            input,
            root.display()
        )));
    }

    Ok(full_path)
}

/// Maps a virtual path onto an absolute POSIX path inside a container workdir.
pub fn container_path(workdir: &str, input: &str) -> Result<String> {
    let relative = normalize_virtual_path(input)?;
    let mut path = workdir.trim_end_matches('/').to_string();
    for component in relative.components() {
        path.push('/');
        path.push_str(&component.as_os_str().to_string_lossy());
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok(path)
}

/// Renders an actual path back into its virtual form, relative to `root`.
pub fn to_virtual_path(root: &Path, actual: &Path) -> Option<String> {
    let relative = actual.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
