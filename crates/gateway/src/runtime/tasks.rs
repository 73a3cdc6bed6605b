//! Task snapshot ledger — a bounded, persisted view of recent work used
//! for auditing and the introspection fast-path. The event log remains the
//! canonical history; this is the cheap queryable surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ab_domain::event::RunState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: String,
    pub title: String,
    pub status: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskStore {
    inner: Mutex<HashMap<String, TaskRecord>>,
    persist_path: PathBuf,
}

impl TaskStore {
    pub fn load(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let persist_path = data_dir.join("tasks.json");
        let mut map = HashMap::new();
        if persist_path.exists() {
            let raw = std::fs::read_to_string(&persist_path)?;
            if let Ok(records) = serde_json::from_str::<Vec<TaskRecord>>(&raw) {
                for r in records {
                    map.insert(r.run_id.clone(), r);
                }
            }
        }
        Ok(Self {
            inner: Mutex::new(map),
            persist_path,
        })
    }

    fn persist_locked(&self, map: &HashMap<String, TaskRecord>) {
        let records: Vec<&TaskRecord> = map.values().collect();
        if let Ok(json) = serde_json::to_string_pretty(&records) {
            let tmp = self.persist_path.with_extension("json.tmp");
            if std::fs::write(&tmp, json)
                .and_then(|_| std::fs::rename(&tmp, &self.persist_path))
                .is_err()
            {
                tracing::warn!("failed to persist task snapshot");
            }
        }
    }

    pub fn upsert_from_run(&self, run_id: &str, input_text: &str) {
        let now = Utc::now();
        let title: String = input_text.trim().chars().take(80).collect();
        let mut map = self.inner.lock();
        map.insert(
            run_id.to_string(),
            TaskRecord {
                run_id: run_id.to_string(),
                title,
                status: RunState::Running,
                created_at: now,
                updated_at: now,
            },
        );
        self.persist_locked(&map);
    }

    pub fn set_status(&self, run_id: &str, status: RunState) {
        let mut map = self.inner.lock();
        if let Some(task) = map.get_mut(run_id) {
            task.status = status;
            task.updated_at = Utc::now();
            self.persist_locked(&map);
        }
    }

    pub fn mark_finished(&self, run_id: &str, status: RunState) {
        self.set_status(run_id, status);
    }

    /// All tasks, most recently updated first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut out: Vec<TaskRecord> = self.inner.lock().values().cloned().collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    pub fn active(&self) -> Vec<TaskRecord> {
        self.list()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect()
    }

    /// Drop terminal tasks beyond the retention window (age and count).
    /// Returns the number removed.
    pub fn purge_done(&self, keep_days: u64, keep_max: usize) -> usize {
        let cutoff = Utc::now() - Duration::days(keep_days as i64);
        let mut map = self.inner.lock();

        let mut terminal: Vec<(DateTime<Utc>, String)> = map
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.updated_at, t.run_id.clone()))
            .collect();
        // Newest first; everything past keep_max or older than cutoff goes.
        terminal.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (i, (updated, run_id)) in terminal.iter().enumerate() {
            if i >= keep_max || *updated < cutoff {
                map.remove(run_id);
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist_locked(&map);
        }
        removed
    }

    /// Close non-terminal tasks idle past the cutoff. Runs awaiting a
    /// permission decision are exempt — their lifetime is bounded by
    /// permission expiry instead. Returns the number closed.
    pub fn auto_close_stale(&self, stale_after: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - Duration::from_std(stale_after).unwrap_or_else(|_| Duration::seconds(0));
        let mut map = self.inner.lock();
        let mut closed = 0;
        for task in map.values_mut() {
            if !task.status.is_terminal()
                && task.status != RunState::WaitingPermission
                && task.updated_at < cutoff
            {
                task.status = RunState::Stopped;
                task.updated_at = Utc::now();
                closed += 1;
            }
        }
        if closed > 0 {
            self.persist_locked(&map);
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_and_finish() {
        let (_dir, store) = store();
        store.upsert_from_run("run_1", "write me an essay about ducks");
        assert_eq!(store.active().len(), 1);

        store.mark_finished("run_1", RunState::Done);
        assert!(store.active().is_empty());
        assert_eq!(store.list()[0].status, RunState::Done);
    }

    #[test]
    fn title_is_truncated() {
        let (_dir, store) = store();
        store.upsert_from_run("run_1", &"x".repeat(300));
        assert_eq!(store.list()[0].title.len(), 80);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::load(dir.path()).unwrap();
            store.upsert_from_run("run_1", "persisted");
            store.mark_finished("run_1", RunState::Failed);
        }
        let store = TaskStore::load(dir.path()).unwrap();
        assert_eq!(store.list()[0].status, RunState::Failed);
    }

    #[test]
    fn purge_done_respects_count_cap() {
        let (_dir, store) = store();
        for i in 0..5 {
            let id = format!("run_{i}");
            store.upsert_from_run(&id, "task");
            store.mark_finished(&id, RunState::Done);
        }
        store.upsert_from_run("run_live", "still going");

        let removed = store.purge_done(30, 2);
        assert_eq!(removed, 3);
        // Live task untouched.
        assert_eq!(store.active().len(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn auto_close_skips_waiting_permission() {
        let (_dir, store) = store();
        store.upsert_from_run("run_stale", "stale one");
        store.upsert_from_run("run_waiting", "asking for permission");
        store.set_status("run_waiting", RunState::WaitingPermission);

        // Backdate both.
        {
            let mut map = store.inner.lock();
            for task in map.values_mut() {
                task.updated_at = Utc::now() - Duration::hours(10);
            }
        }

        let closed = store.auto_close_stale(std::time::Duration::from_secs(3600));
        assert_eq!(closed, 1);
        let by_id: HashMap<String, RunState> = store
            .list()
            .into_iter()
            .map(|t| (t.run_id, t.status))
            .collect();
        assert_eq!(by_id["run_stale"], RunState::Stopped);
        assert_eq!(by_id["run_waiting"], RunState::WaitingPermission);
    }
}
