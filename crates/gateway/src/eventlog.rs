//! The append-only event log — canonical history of every run.
//!
//! One active JSONL segment plus a dated archive directory. `seq` is
//! globally monotonic across rotations and recovered on startup by reading
//! the tail of the newest segment. The writer holds an exclusive lock for
//! append and segment swap; scans of the active segment take the shared
//! side of the same lock, and archived segments are read without locking.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use ab_domain::config::LogRotation;
use ab_domain::error::{Error, Result};
use ab_domain::event::{EventKind, EventRecord};
use ab_memory::prune_archives;

const ACTIVE_FILE: &str = "events.jsonl";
const ARCHIVE_DIR: &str = "archives";
const KIND: &str = "events";

struct ActiveSegment {
    file: std::fs::File,
    size: u64,
}

pub struct EventLog {
    dir: PathBuf,
    rotation: LogRotation,
    seq: AtomicU64,
    active: RwLock<ActiveSegment>,
}

impl EventLog {
    pub fn open(dir: &Path, rotation: LogRotation) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(dir.join(ARCHIVE_DIR))?;
        let path = dir.join(ACTIVE_FILE);

        let last_seq = recover_last_seq(dir, &path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            dir: dir.to_path_buf(),
            rotation,
            seq: AtomicU64::new(last_seq),
            active: RwLock::new(ActiveSegment { file, size }),
        })
    }

    /// Append one event. Returns the completed record (with its assigned
    /// `seq`) only after the line has been flushed to the OS — it will
    /// survive a clean process restart.
    pub fn append(&self, run_id: &str, event: EventKind) -> Result<EventRecord> {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            ts: Utc::now(),
            run_id: run_id.to_string(),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut active = self.active.write();
        active.file.write_all(line.as_bytes())?;
        active.file.flush()?;
        active.size += line.len() as u64;

        // Rotation never happens mid-append: we still hold the writer lock.
        if self.rotation.max_bytes > 0 && active.size >= self.rotation.max_bytes {
            self.rotate_locked(&mut active)?;
        }
        Ok(record)
    }

    fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<()> {
        let path = self.dir.join(ACTIVE_FILE);
        let ts = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let dst = self.dir.join(ARCHIVE_DIR).join(format!("{KIND}_{ts}.jsonl"));
        std::fs::rename(&path, &dst)?;
        active.file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        active.size = 0;
        tracing::info!(archive = %dst.display(), "event log segment rotated");
        Ok(())
    }

    /// Read events with `seq > from_seq`, oldest first, across archives and
    /// the active segment, capped at `limit`.
    pub fn scan(&self, from_seq: u64, limit: usize) -> Result<Vec<EventRecord>> {
        let mut out = Vec::new();

        for path in self.archive_paths()? {
            scan_file(&path, from_seq, limit, &mut out)?;
            if out.len() >= limit {
                out.truncate(limit);
                return Ok(out);
            }
        }

        // Active segment under the shared lock.
        let path = self.dir.join(ACTIVE_FILE);
        {
            let _guard = self.active.read();
            scan_file(&path, from_seq, limit, &mut out)?;
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Events of one run with `seq > from_seq`, oldest first.
    pub fn run_events(&self, run_id: &str, from_seq: u64, limit: usize) -> Result<Vec<EventRecord>> {
        // Scan generously, then filter: a run's events are interleaved with
        // other runs' in the shared log.
        let all = self.scan(from_seq, limit.saturating_mul(64).max(4096))?;
        Ok(all
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .take(limit)
            .collect())
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn current_size(&self) -> u64 {
        self.active.read().size
    }

    /// Drop archives beyond the retention window. Called by the supervisor.
    pub fn prune(&self) -> Result<usize> {
        prune_archives(
            &self.dir,
            KIND,
            self.rotation.keep_days,
            self.rotation.keep_max_files,
        )
    }

    fn archive_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.dir.join(ARCHIVE_DIR);
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with(KIND) && n.ends_with(".jsonl")
                    })
                    .unwrap_or(false)
            })
            .collect();
        // Timestamped names sort chronologically.
        paths.sort();
        Ok(paths)
    }
}

fn scan_file(path: &Path, from_seq: u64, limit: usize, out: &mut Vec<EventRecord>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(path)?;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(rec) if rec.seq > from_seq => {
                out.push(rec);
                if out.len() >= limit {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed event log line");
            }
        }
    }
    Ok(())
}

/// Recover the highest assigned seq: tail of the active segment, falling
/// back to the newest archive when the active file is empty.
fn recover_last_seq(dir: &Path, active_path: &Path) -> Result<u64> {
    if let Some(seq) = last_seq_in_file(active_path)? {
        return Ok(seq);
    }
    let archive_dir = dir.join(ARCHIVE_DIR);
    if archive_dir.exists() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&archive_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        paths.sort();
        if let Some(newest) = paths.last() {
            if let Some(seq) = last_seq_in_file(newest)? {
                return Ok(seq);
            }
        }
    }
    Ok(0)
}

fn last_seq_in_file(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut last = None;
    for line in raw.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<EventRecord>(line) {
            last = Some(rec.seq);
            break;
        }
    }
    Ok(last)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ab_domain::event::RunState;

    fn log_in(dir: &Path) -> EventLog {
        EventLog::open(dir, LogRotation::default()).unwrap()
    }

    #[test]
    fn seq_is_monotonic_and_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let mut prev = 0;
        for i in 0..20 {
            let rec = log
                .append("run_a", EventKind::Token { text: format!("t{i}") })
                .unwrap();
            assert_eq!(rec.seq, prev + 1, "gap at {i}");
            prev = rec.seq;
        }
    }

    #[test]
    fn seq_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = log_in(dir.path());
            for _ in 0..5 {
                log.append("run_a", EventKind::Token { text: "x".into() }).unwrap();
            }
        }
        let log = log_in(dir.path());
        assert_eq!(log.last_seq(), 5);
        let rec = log
            .append("run_b", EventKind::RunStatus { status: RunState::Running })
            .unwrap();
        assert_eq!(rec.seq, 6);
    }

    #[test]
    fn scan_from_seq_returns_newer_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        for i in 0..10 {
            log.append("run_a", EventKind::Token { text: format!("{i}") }).unwrap();
        }
        let events = log.scan(7, 100).unwrap();
        let seqs: Vec<u64> = events.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn rotation_preserves_global_seq_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let rotation = LogRotation {
            max_bytes: 400,
            keep_days: 30,
            keep_max_files: 10,
        };
        let log = EventLog::open(dir.path(), rotation).unwrap();
        for i in 0..30 {
            log.append("run_a", EventKind::Token { text: format!("token {i}") }).unwrap();
        }

        // At least one rotation happened.
        let archives = std::fs::read_dir(dir.path().join("archives")).unwrap().count();
        assert!(archives >= 1, "expected a rotated segment");

        // Seq remains globally monotonic across segments and scan sees all.
        let events = log.scan(0, 1000).unwrap();
        assert_eq!(events.len(), 30);
        for (i, rec) in events.iter().enumerate() {
            assert_eq!(rec.seq, i as u64 + 1);
        }
    }

    #[test]
    fn seq_recovers_from_archive_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rotation = LogRotation {
                max_bytes: 1, // rotate after every append
                keep_days: 30,
                keep_max_files: 10,
            };
            let log = EventLog::open(dir.path(), rotation).unwrap();
            log.append("run_a", EventKind::Token { text: "x".into() }).unwrap();
            // Active segment is now empty; the seq lives in the archive.
        }
        let log = log_in(dir.path());
        assert_eq!(log.last_seq(), 1);
    }

    #[test]
    fn run_events_filters_interleaved_runs() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        for i in 0..6 {
            let run = if i % 2 == 0 { "run_a" } else { "run_b" };
            log.append(run, EventKind::Token { text: format!("{i}") }).unwrap();
        }
        let a_events = log.run_events("run_a", 0, 100).unwrap();
        assert_eq!(a_events.len(), 3);
        assert!(a_events.iter().all(|r| r.run_id == "run_a"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.append("run_a", EventKind::Token { text: "ok".into() }).unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join("events.jsonl"))
                .unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        log.append("run_a", EventKind::Token { text: "also ok".into() }).unwrap();
        assert_eq!(log.scan(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn current_size_tracks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        assert_eq!(log.current_size(), 0);
        log.append("run_a", EventKind::Token { text: "x".into() }).unwrap();
        assert!(log.current_size() > 0);
    }
}
