//! The execution plane: run records, the turn executor, permission broker,
//! cancellation, tool dispatch, worker delegation, scheduling, and the task
//! snapshot ledger.

pub mod cancel;
pub mod permissions;
pub mod runs;
pub mod scheduler;
pub mod tasks;
pub mod tools;
pub mod turn;
pub mod workers;

use ab_domain::error::{Error, Result};
use ab_domain::event::{EventKind, PermissionDecision, RunState};

use crate::events::emit;
use crate::state::AppState;

/// Stop a run. Idempotent while the run is live; a stop on a terminal run
/// is rejected as a state conflict (the run is left untouched).
///
/// Queued runs are removed from their session queue and finalized here;
/// live runs are signalled and finalize themselves at the next suspension
/// point. Worker children of the stopped run are stopped with it.
pub fn stop_run(state: &AppState, run_id: &str) -> Result<RunState> {
    let run = state
        .runs
        .get(run_id)
        .ok_or_else(|| Error::StateConflict(format!("unknown run: {run_id}")))?;

    if run.state.is_terminal() {
        return Err(Error::StateConflict(format!(
            "run {run_id} already terminal"
        )));
    }

    // Still queued: it never reached the executor, finalize directly.
    if run.state == RunState::Queued && state.sessions.take_queued(run_id) {
        state.runs.finish(run_id, RunState::Stopped, None);
        let _ = emit(state, run_id, EventKind::RunStatus { status: RunState::Stopped });
        let _ = emit(
            state,
            run_id,
            EventKind::RunFinal {
                state: RunState::Stopped,
                usage: None,
                error: None,
                error_kind: None,
                stop_reason: Some("stopped before start".into()),
            },
        );
        state.tasks.mark_finished(run_id, RunState::Stopped);
        return Ok(RunState::Stopped);
    }

    state.runs.request_stop(run_id);
    let _ = emit(state, run_id, EventKind::RunStatus { status: RunState::Stopping });

    // Wake a permission wait as deny, then signal the cancel token.
    for resolved in state.broker.deny_all_for_run(run_id) {
        let _ = emit(
            state,
            run_id,
            EventKind::PermissionResponse {
                perm_id: resolved.perm_id,
                decision: PermissionDecision::Deny,
            },
        );
    }
    state.cancels.cancel(run_id);

    // Cascade to live worker children.
    for child in state.runs.active_children(run_id) {
        let _ = stop_run(state, &child.run_id);
    }

    Ok(RunState::Stopping)
}
