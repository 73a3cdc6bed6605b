//! Filesystem tools. Every operation resolves its path and, when an
//! allowed root is configured, refuses anything that escapes it.

use std::path::{Path, PathBuf};

use serde::Serialize;

use ab_domain::error::{Error, Result};

const MAX_READ_BYTES: u64 = 2_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Resolve a path against the allowed root. Canonicalizes the longest
/// existing ancestor so `..` segments can't sidestep the fence even for
/// not-yet-existing files.
fn resolve(path: &str, allowed_root: Option<&Path>) -> Result<PathBuf> {
    let requested = PathBuf::from(path);

    let canonical = if requested.exists() {
        requested.canonicalize().map_err(Error::Io)?
    } else {
        let parent = requested
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::Other(format!("invalid path: {path}")))?;
        let file_name = requested
            .file_name()
            .ok_or_else(|| Error::Other(format!("invalid path: {path}")))?;
        parent.canonicalize().map_err(Error::Io)?.join(file_name)
    };

    if let Some(root) = allowed_root {
        let root = root.canonicalize().map_err(Error::Io)?;
        if !canonical.starts_with(&root) {
            return Err(Error::PolicyDenied(format!(
                "path {} is outside the allowed root",
                canonical.display()
            )));
        }
    }
    Ok(canonical)
}

pub async fn read(path: &str, allowed_root: Option<&Path>) -> Result<String> {
    let resolved = resolve(path, allowed_root)?;
    let meta = tokio::fs::metadata(&resolved).await?;
    if meta.len() > MAX_READ_BYTES {
        return Err(Error::Tool {
            tool: "fs_read".into(),
            message: format!("file too large ({} bytes)", meta.len()),
        });
    }
    Ok(tokio::fs::read_to_string(&resolved).await?)
}

pub async fn list(path: &str, allowed_root: Option<&Path>) -> Result<Vec<DirEntry>> {
    let resolved = resolve(path, allowed_root)?;
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(&resolved).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub async fn write(path: &str, content: &str, allowed_root: Option<&Path>) -> Result<usize> {
    let resolved = resolve(path, allowed_root)?;
    tokio::fs::write(&resolved, content).await?;
    Ok(content.len())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
