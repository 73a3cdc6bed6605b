//! Worker manager — bounded sub-worker delegation.
//!
//! The executor exposes a `delegate` pseudo-tool. Each invocation admits a
//! child run (kind `worker`) into its own worker session; the parent may
//! await the result envelope or continue immediately. Delegation depth is
//! capped, and recently terminated workers are retained for `workers.list`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;

use ab_domain::error::{Error, Result};
use ab_domain::event::{RunKind, RunState};

use crate::runtime::runs::Run;
use crate::runtime::tools::ToolContext;
use crate::state::AppState;

/// The standard envelope a worker's `run.final` hands back to its parent.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub summary: String,
    pub artifacts: Vec<serde_json::Value>,
    pub errors: Vec<String>,
    pub state: RunState,
}

/// A terminated worker kept for auditing.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub parent_run_id: String,
    pub role: String,
    pub state: RunState,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Clone)]
struct LiveWorker {
    role: String,
    parent_run_id: String,
}

pub struct WorkerManager {
    max_depth: u32,
    max_retained: usize,
    /// Live workers keyed by run id.
    live: Mutex<HashMap<String, LiveWorker>>,
    /// Parents awaiting a child's envelope.
    waiters: Mutex<HashMap<String, oneshot::Sender<ResultEnvelope>>>,
    /// Recently terminated workers, newest last.
    retained: Mutex<VecDeque<WorkerRecord>>,
}

impl WorkerManager {
    pub fn new(max_depth: u32, max_retained: usize) -> Self {
        Self {
            max_depth,
            max_retained,
            live: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            retained: Mutex::new(VecDeque::new()),
        }
    }

    /// Resolve a finished worker: deliver the envelope to an awaiting
    /// parent and move the record into the retained ring.
    pub fn complete(&self, run_id: &str, envelope: ResultEnvelope) {
        let live = self.live.lock().remove(run_id).unwrap_or(LiveWorker {
            role: "worker".into(),
            parent_run_id: String::new(),
        });

        let record = WorkerRecord {
            worker_id: run_id.to_string(),
            parent_run_id: live.parent_run_id,
            role: live.role,
            state: envelope.state,
            finished_at: Utc::now(),
            summary: truncate(&envelope.summary, 400),
        };

        {
            let mut retained = self.retained.lock();
            retained.push_back(record);
            while retained.len() > self.max_retained {
                retained.pop_front();
            }
        }

        if let Some(tx) = self.waiters.lock().remove(run_id) {
            let _ = tx.send(envelope);
        }
    }

    pub fn retained(&self) -> Vec<WorkerRecord> {
        self.retained.lock().iter().cloned().collect()
    }

    pub fn live_role(&self, run_id: &str) -> Option<String> {
        self.live.lock().get(run_id).map(|w| w.role.clone())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create and admit a child worker run. With `wait`, suspends until the
/// child terminates and returns its envelope; otherwise returns the handle
/// immediately.
pub async fn delegate(
    state: &AppState,
    ctx: &ToolContext,
    role: &str,
    task: &str,
    wait: bool,
) -> Result<serde_json::Value> {
    let child_depth = ctx.depth + 1;
    if child_depth > state.workers.max_depth {
        return Err(Error::ResourceExhausted(format!(
            "delegation depth {child_depth} exceeds the cap ({})",
            state.workers.max_depth
        )));
    }

    let mut child = Run::new(
        ctx.run_id.clone(),
        ctx.origin_channel.clone(),
        String::new(), // session key set below from the child's own id
        RunKind::Worker,
        task,
    );
    child.parent_run_id = Some(ctx.run_id.clone());
    child.depth = child_depth;
    child.session_key = format!("worker:{}", child.run_id);
    let child_id = child.run_id.clone();

    state.workers.live.lock().insert(
        child_id.clone(),
        LiveWorker {
            role: role.to_string(),
            parent_run_id: ctx.run_id.clone(),
        },
    );

    let rx = if wait {
        let (tx, rx) = oneshot::channel();
        state.workers.waiters.lock().insert(child_id.clone(), tx);
        Some(rx)
    } else {
        None
    };

    state.cancels.add_child(&ctx.run_id, &child_id);
    state.sessions.admit(state, child)?;
    tracing::info!(parent = %ctx.run_id, worker = %child_id, role, "worker delegated");

    match rx {
        Some(rx) => match rx.await {
            Ok(envelope) => Ok(json!({
                "worker_id": child_id,
                "summary": envelope.summary,
                "artifacts": envelope.artifacts,
                "errors": envelope.errors,
                "state": envelope.state,
            })),
            Err(_) => Err(Error::Tool {
                tool: "delegate".into(),
                message: format!("worker {child_id} vanished before completion"),
            }),
        },
        None => Ok(json!({"worker_id": child_id, "state": "queued"})),
    }
}

/// Live + recently terminated workers for `workers.list`.
pub fn list_workers(state: &AppState) -> Vec<serde_json::Value> {
    let mut out: Vec<serde_json::Value> = state
        .runs
        .active()
        .into_iter()
        .filter(|r| r.kind == RunKind::Worker)
        .map(|r| {
            json!({
                "worker_id": r.run_id,
                "parent_run_id": r.parent_run_id,
                "role": state.workers.live_role(&r.run_id).unwrap_or_else(|| "worker".into()),
                "state": r.state,
            })
        })
        .collect();
    for rec in state.workers.retained() {
        out.push(serde_json::to_value(&rec).unwrap_or_default());
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_envelope_to_waiter() {
        let mgr = WorkerManager::new(2, 10);
        mgr.live.lock().insert(
            "run_w".into(),
            LiveWorker {
                role: "quant".into(),
                parent_run_id: "run_p".into(),
            },
        );
        let (tx, rx) = oneshot::channel();
        mgr.waiters.lock().insert("run_w".into(), tx);

        mgr.complete(
            "run_w",
            ResultEnvelope {
                summary: "done the maths".into(),
                artifacts: vec![],
                errors: vec![],
                state: RunState::Done,
            },
        );

        let envelope = rx.await.unwrap();
        assert_eq!(envelope.summary, "done the maths");
        let retained = mgr.retained();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].role, "quant");
    }

    #[test]
    fn retained_ring_is_bounded() {
        let mgr = WorkerManager::new(2, 3);
        for i in 0..6 {
            mgr.complete(
                &format!("run_{i}"),
                ResultEnvelope {
                    summary: format!("s{i}"),
                    artifacts: vec![],
                    errors: vec![],
                    state: RunState::Done,
                },
            );
        }
        let retained = mgr.retained();
        assert_eq!(retained.len(), 3);
        assert_eq!(retained[0].summary, "s3");
    }

    #[test]
    fn complete_without_waiter_is_fine() {
        let mgr = WorkerManager::new(2, 10);
        mgr.complete(
            "run_lonely",
            ResultEnvelope {
                summary: "nobody listened".into(),
                artifacts: vec![],
                errors: vec!["ignored".into()],
                state: RunState::Failed,
            },
        );
        assert_eq!(mgr.retained().len(), 1);
        assert_eq!(mgr.retained()[0].state, RunState::Failed);
    }
}
