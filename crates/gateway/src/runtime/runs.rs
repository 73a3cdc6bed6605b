//! Run tracking — in-memory records for every unit of work, with the
//! lifecycle guardrails: a run terminates exactly once, transitions out of
//! a terminal state are rejected, and the earliest terminal decision wins.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use ab_domain::event::{new_run_id, RunKind, RunState};

/// Bounded ring of runs kept in memory. Terminal history beyond this lives
/// in the event log and the task snapshot.
const MAX_RUNS_IN_MEMORY: usize = 2000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub run_id: String,
    /// Where this run came from: a channel id, `scheduler:<id>`, or the
    /// parent run id for workers.
    pub origin: String,
    /// The channel receiving this run's events (inherited from the root
    /// run for workers; `None` for scheduler-originated runs).
    pub origin_channel: Option<String>,
    pub session_key: String,
    pub kind: RunKind,
    pub state: RunState,
    pub input_text: String,
    /// Set for worker runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Delegation depth: 0 for top-level runs.
    pub depth: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_event_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    pub fn new(
        origin: impl Into<String>,
        origin_channel: Option<String>,
        session_key: impl Into<String>,
        kind: RunKind,
        input_text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: new_run_id(),
            origin: origin.into(),
            origin_channel,
            session_key: session_key.into(),
            kind,
            state: RunState::Queued,
            input_text: input_text.into(),
            parent_run_id: None,
            depth: 0,
            started_at: now,
            updated_at: now,
            last_event_seq: 0,
            error: None,
        }
    }
}

/// Outcome of a terminal-state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The run reached `state` through this call.
    Finished(RunState),
    /// The run was already terminal; nothing changed.
    AlreadyTerminal(RunState),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunStoreInner {
    runs: VecDeque<Run>,
    index: HashMap<String, usize>,
    /// Logical sequence number of the front element; lets the index survive
    /// front evictions without bulk rewrites.
    base: usize,
}

impl RunStoreInner {
    fn get_mut(&mut self, run_id: &str) -> Option<&mut Run> {
        let seq = *self.index.get(run_id)?;
        self.runs.get_mut(seq - self.base)
    }

    fn get(&self, run_id: &str) -> Option<&Run> {
        let seq = *self.index.get(run_id)?;
        self.runs.get(seq - self.base)
    }

    fn push_back(&mut self, run: Run) {
        let seq = self.base + self.runs.len();
        self.index.insert(run.run_id.clone(), seq);
        self.runs.push_back(run);
        if self.runs.len() > MAX_RUNS_IN_MEMORY {
            if let Some(evicted) = self.runs.pop_front() {
                self.index.remove(&evicted.run_id);
                self.base += 1;
            }
        }
    }
}

pub struct RunStore {
    inner: RwLock<RunStoreInner>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RunStoreInner {
                runs: VecDeque::new(),
                index: HashMap::new(),
                base: 0,
            }),
        }
    }

    pub fn insert(&self, run: Run) -> String {
        let run_id = run.run_id.clone();
        self.inner.write().push_back(run);
        run_id
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.inner.read().get(run_id).cloned()
    }

    /// Apply a mutation to a run. Returns the updated copy if found.
    pub fn update<F>(&self, run_id: &str, f: F) -> Option<Run>
    where
        F: FnOnce(&mut Run),
    {
        let mut inner = self.inner.write();
        let run = inner.get_mut(run_id)?;
        f(run);
        run.updated_at = Utc::now();
        Some(run.clone())
    }

    /// Move a run into a non-terminal state. Rejected (returns `None`) when
    /// the run is unknown or already terminal.
    pub fn set_state(&self, run_id: &str, state: RunState) -> Option<Run> {
        debug_assert!(!state.is_terminal(), "use finish() for terminal states");
        let mut inner = self.inner.write();
        let run = inner.get_mut(run_id)?;
        if run.state.is_terminal() {
            return None;
        }
        run.state = state;
        run.updated_at = Utc::now();
        Some(run.clone())
    }

    /// Resolve a run's terminal state exactly once.
    ///
    /// The earliest terminal decision wins: a second call reports
    /// `AlreadyTerminal` and changes nothing. A `Done`/`Failed` landing on a
    /// run in `Stopping` is recorded as `Stopped` — a stop observed before
    /// `run.final` always yields `stopped`.
    pub fn finish(
        &self,
        run_id: &str,
        desired: RunState,
        error: Option<String>,
    ) -> Option<FinishOutcome> {
        debug_assert!(desired.is_terminal());
        let mut inner = self.inner.write();
        let run = inner.get_mut(run_id)?;
        if run.state.is_terminal() {
            return Some(FinishOutcome::AlreadyTerminal(run.state));
        }
        let effective = if run.state == RunState::Stopping {
            RunState::Stopped
        } else {
            desired
        };
        run.state = effective;
        run.error = error;
        run.updated_at = Utc::now();
        Some(FinishOutcome::Finished(effective))
    }

    /// Mark a run stopping. Returns the run when the transition applied,
    /// `None` when the run is unknown or already terminal.
    pub fn request_stop(&self, run_id: &str) -> Option<Run> {
        let mut inner = self.inner.write();
        let run = inner.get_mut(run_id)?;
        if run.state.is_terminal() {
            return None;
        }
        run.state = RunState::Stopping;
        run.updated_at = Utc::now();
        Some(run.clone())
    }

    pub fn record_event_seq(&self, run_id: &str, seq: u64) {
        let mut inner = self.inner.write();
        if let Some(run) = inner.get_mut(run_id) {
            run.last_event_seq = seq;
        }
    }

    /// Non-terminal runs, newest first.
    pub fn active(&self) -> Vec<Run> {
        let inner = self.inner.read();
        inner
            .runs
            .iter()
            .rev()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Children of a run that are still non-terminal.
    pub fn active_children(&self, parent_run_id: &str) -> Vec<Run> {
        let inner = self.inner.read();
        inner
            .runs
            .iter()
            .filter(|r| {
                r.parent_run_id.as_deref() == Some(parent_run_id) && !r.state.is_terminal()
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().runs.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::new(
            "ws:cli",
            Some("ws:cli".into()),
            "ws:cli",
            RunKind::Interactive,
            "hello",
        )
    }

    #[test]
    fn insert_and_get() {
        let store = RunStore::new();
        let run_id = store.insert(sample_run());
        let run = store.get(&run_id).unwrap();
        assert_eq!(run.state, RunState::Queued);
        assert_eq!(run.origin, "ws:cli");
    }

    #[test]
    fn finish_is_exactly_once() {
        let store = RunStore::new();
        let run_id = store.insert(sample_run());
        store.set_state(&run_id, RunState::Running);

        let first = store.finish(&run_id, RunState::Done, None).unwrap();
        assert_eq!(first, FinishOutcome::Finished(RunState::Done));

        let second = store.finish(&run_id, RunState::Failed, Some("late".into())).unwrap();
        assert_eq!(second, FinishOutcome::AlreadyTerminal(RunState::Done));
        assert_eq!(store.get(&run_id).unwrap().state, RunState::Done);
        // The late error did not overwrite anything.
        assert!(store.get(&run_id).unwrap().error.is_none());
    }

    #[test]
    fn stop_before_final_yields_stopped() {
        let store = RunStore::new();
        let run_id = store.insert(sample_run());
        store.set_state(&run_id, RunState::Running);

        // Stop lands between the last chunk and run.final.
        assert!(store.request_stop(&run_id).is_some());

        let out = store.finish(&run_id, RunState::Done, None).unwrap();
        assert_eq!(out, FinishOutcome::Finished(RunState::Stopped));
    }

    #[test]
    fn stop_on_terminal_run_is_rejected() {
        let store = RunStore::new();
        let run_id = store.insert(sample_run());
        store.set_state(&run_id, RunState::Running);
        store.finish(&run_id, RunState::Done, None);
        assert!(store.request_stop(&run_id).is_none());
    }

    #[test]
    fn set_state_rejected_after_terminal() {
        let store = RunStore::new();
        let run_id = store.insert(sample_run());
        store.finish(&run_id, RunState::Failed, Some("boom".into()));
        assert!(store.set_state(&run_id, RunState::Running).is_none());
        assert_eq!(store.get(&run_id).unwrap().state, RunState::Failed);
    }

    #[test]
    fn active_children_tracks_workers() {
        let store = RunStore::new();
        let parent_id = store.insert(sample_run());

        let mut child = Run::new(
            parent_id.clone(),
            Some("ws:cli".into()),
            format!("worker:{parent_id}"),
            RunKind::Worker,
            "subtask",
        );
        child.parent_run_id = Some(parent_id.clone());
        child.depth = 1;
        let child_id = store.insert(child);

        assert_eq!(store.active_children(&parent_id).len(), 1);
        store.finish(&child_id, RunState::Done, None);
        assert!(store.active_children(&parent_id).is_empty());
    }

    #[test]
    fn bounded_ring_evicts_front() {
        let store = RunStore::new();
        let first_id = store.insert(sample_run());
        for _ in 0..MAX_RUNS_IN_MEMORY {
            store.insert(sample_run());
        }
        assert_eq!(store.len(), MAX_RUNS_IN_MEMORY);
        assert!(store.get(&first_id).is_none());
    }
}
