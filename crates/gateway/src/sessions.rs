//! Per-session FIFO queues. A session admits one run at a time to the
//! executor; everything else waits in order behind a soft cap.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use ab_domain::error::{Error, Result};
use ab_domain::event::EventKind;

use crate::runtime::runs::Run;
use crate::state::AppState;

#[derive(Default)]
struct SessionEntry {
    queue: VecDeque<String>,
    active_run_id: Option<String>,
    pump_active: bool,
}

/// Snapshot of one session for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    pub session_key: String,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    queue_soft_cap: usize,
}

impl SessionManager {
    pub fn new(queue_soft_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue_soft_cap,
        }
    }

    /// Admit a run into its session's queue and make sure the pump task is
    /// running. Returns the run id and its queue position (0 = next to run).
    ///
    /// Beyond the soft cap the request is rejected with `queue_full` and
    /// the queue is left unchanged.
    pub fn admit(&self, state: &AppState, run: Run) -> Result<(String, usize)> {
        let session_key = run.session_key.clone();
        let run_id = run.run_id.clone();

        let position = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.entry(session_key.clone()).or_default();
            if entry.queue.len() >= self.queue_soft_cap {
                return Err(Error::ResourceExhausted("queue_full".into()));
            }
            // Insert into the run store before the id becomes poppable.
            state.runs.insert(run);
            entry.queue.push_back(run_id.clone());
            let position = entry.queue.len() - 1 + usize::from(entry.active_run_id.is_some());
            if !entry.pump_active {
                entry.pump_active = true;
                let state = state.clone();
                let key = session_key.clone();
                tokio::spawn(async move {
                    pump(state, key).await;
                });
            }
            position
        };

        if position > 0 {
            let _ = crate::events::emit(state, &run_id, EventKind::RunQueued { position });
        }
        Ok((run_id, position))
    }

    fn pop_next(&self, session_key: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(session_key)?;
        match entry.queue.pop_front() {
            Some(run_id) => {
                entry.active_run_id = Some(run_id.clone());
                Some(run_id)
            }
            None => {
                entry.active_run_id = None;
                entry.pump_active = false;
                None
            }
        }
    }

    fn clear_active(&self, session_key: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_key) {
            entry.active_run_id = None;
        }
    }

    /// The run `run.stop` without an explicit id targets: the active run,
    /// else the most recently queued one.
    pub fn latest_run(&self, session_key: &str) -> Option<String> {
        let sessions = self.sessions.lock();
        let entry = sessions.get(session_key)?;
        entry
            .active_run_id
            .clone()
            .or_else(|| entry.queue.back().cloned())
    }

    /// Remove a still-queued run from its session. Returns `true` when the
    /// run had not yet been admitted to the executor.
    pub fn take_queued(&self, run_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        for entry in sessions.values_mut() {
            if let Some(pos) = entry.queue.iter().position(|id| id == run_id) {
                entry.queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock();
        let mut out: Vec<SessionStatus> = sessions
            .iter()
            .map(|(key, entry)| SessionStatus {
                session_key: key.clone(),
                queue_depth: entry.queue.len() + usize::from(entry.active_run_id.is_some()),
                active_run_id: entry.active_run_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        out
    }

    /// Drop empty idle session entries (supervisor maintenance).
    pub fn prune_idle(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, e| e.pump_active || !e.queue.is_empty() || e.active_run_id.is_some());
    }
}

/// The per-session pump: drain the FIFO one run at a time.
async fn pump(state: AppState, session_key: String) {
    loop {
        let Some(run_id) = state.sessions.pop_next(&session_key) else {
            return;
        };
        crate::runtime::turn::execute_run(&state, &run_id).await;
        state.sessions.clear_active(&session_key);
    }
}
