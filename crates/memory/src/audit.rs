//! Append-only JSONL audit log with size-based rotation and age/count
//! pruning of rotated archives. The gateway's event log shares the same
//! rotation mechanics via [`rotate_jsonl`] / [`prune_archives`].

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;

use ab_domain::config::LogRotation;
use ab_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rotation primitives
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn archives_dir(base: &Path) -> PathBuf {
    base.join("archives")
}

/// Rotate `active_path` into `<base>/archives/<kind>_<ts>.jsonl` when it
/// exceeds `max_bytes`. Returns the archive path when a rotation happened.
pub fn rotate_jsonl(
    base: &Path,
    kind: &str,
    active_path: &Path,
    max_bytes: u64,
) -> Result<Option<PathBuf>> {
    if max_bytes == 0 || !active_path.exists() {
        return Ok(None);
    }
    let size = std::fs::metadata(active_path)?.len();
    if size < max_bytes {
        return Ok(None);
    }

    let dir = archives_dir(base);
    std::fs::create_dir_all(&dir)?;
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let dst = dir.join(format!("{kind}_{ts}.jsonl"));
    std::fs::rename(active_path, &dst)?;
    std::fs::write(active_path, "")?;
    Ok(Some(dst))
}

/// Delete rotated archives of a kind beyond the retention window.
/// Returns the number of files removed.
pub fn prune_archives(
    base: &Path,
    kind: &str,
    keep_days: u64,
    keep_max_files: usize,
) -> Result<usize> {
    let dir = archives_dir(base);
    if !dir.exists() {
        return Ok(0);
    }

    let prefix = format!("{kind}_");
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".jsonl") {
            let mtime = entry.metadata()?.modified()?;
            files.push((mtime, entry.path()));
        }
    }
    // Newest first.
    files.sort_by(|a, b| b.0.cmp(&a.0));

    let cutoff = if keep_days > 0 {
        Some(std::time::SystemTime::now() - std::time::Duration::from_secs(keep_days * 86_400))
    } else {
        None
    };

    let mut removed = 0;
    let mut kept = 0;
    for (mtime, path) in files {
        let too_old = cutoff.map(|c| mtime < c).unwrap_or(false);
        let over_count = keep_max_files > 0 && kept >= keep_max_files;
        if too_old || over_count {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        } else {
            kept += 1;
        }
    }
    Ok(removed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AuditLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The memory change audit trail (`memory_events.jsonl`).
pub struct AuditLog {
    base: PathBuf,
    active: PathBuf,
    kind: String,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(base: &Path, kind: &str) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let active = base.join(format!("{kind}.jsonl"));
        Ok(Self {
            base: base.to_path_buf(),
            active,
            kind: kind.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn append(&self, action: &str, entity: &str, detail: serde_json::Value) -> Result<()> {
        let rec = serde_json::json!({
            "ts_ms": Utc::now().timestamp_millis(),
            "action": action,
            "entity": entity,
            "detail": detail,
        });
        let line = serde_json::to_string(&rec)?;
        let _guard = self.write_lock.lock();
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Rotate and prune under the given retention settings. Returns
    /// (rotated, pruned_count).
    pub fn rotate_and_prune(&self, rotation: &LogRotation) -> Result<(bool, usize)> {
        let rotated = {
            let _guard = self.write_lock.lock();
            rotate_jsonl(&self.base, &self.kind, &self.active, rotation.max_bytes)?
        };
        let pruned = prune_archives(
            &self.base,
            &self.kind,
            rotation.keep_days,
            rotation.keep_max_files,
        )?;
        Ok((rotated.is_some(), pruned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), "memory_events").unwrap();
        log.append("added", "memory", serde_json::json!({"id": "a"}))
            .unwrap();
        log.append("removed", "memory", serde_json::json!({"id": "a"}))
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("memory_events.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "added");
        assert!(first["ts_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn rotation_moves_active_into_archives() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), "memory_events").unwrap();
        for i in 0..50 {
            log.append("added", "memory", serde_json::json!({"i": i}))
                .unwrap();
        }
        let rotation = LogRotation {
            max_bytes: 64,
            keep_days: 30,
            keep_max_files: 10,
        };
        let (rotated, _) = log.rotate_and_prune(&rotation).unwrap();
        assert!(rotated);

        // Active file is fresh and empty.
        let raw = std::fs::read_to_string(dir.path().join("memory_events.jsonl")).unwrap();
        assert!(raw.is_empty());

        let archives: Vec<_> = std::fs::read_dir(dir.path().join("archives"))
            .unwrap()
            .collect();
        assert_eq!(archives.len(), 1);
    }

    #[test]
    fn small_file_does_not_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), "memory_events").unwrap();
        log.append("added", "memory", serde_json::json!({})).unwrap();
        let rotation = LogRotation::default();
        let (rotated, pruned) = log.rotate_and_prune(&rotation).unwrap();
        assert!(!rotated);
        assert_eq!(pruned, 0);
    }

    #[test]
    fn prune_respects_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let arch = dir.path().join("archives");
        std::fs::create_dir_all(&arch).unwrap();
        for i in 0..5 {
            std::fs::write(arch.join(format!("events_2024010{i}_000000.jsonl")), "x").unwrap();
        }
        let removed = prune_archives(dir.path(), "events", 0, 2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(std::fs::read_dir(&arch).unwrap().count(), 2);
    }
}
