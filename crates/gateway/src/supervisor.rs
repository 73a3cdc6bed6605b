//! The supervisor loop: scheduler ticks every interval, plus a slower
//! maintenance pass for pruning, rotation, permission expiry, and lazy
//! embedding batches.

use std::time::Duration;

use ab_domain::event::{EventKind, PermissionDecision};

use crate::events::{emit, emit_log_line};
use crate::state::AppState;

pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        let tick = Duration::from_secs(state.config.supervisor.interval_s.max(1));
        let maintenance_every = Duration::from_secs(state.config.supervisor.maintenance_interval_s.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_maintenance = tokio::time::Instant::now();
        let mut last_active: Option<usize> = None;

        loop {
            interval.tick().await;

            crate::runtime::scheduler::tick(&state).await;

            // Heartbeat line when the active-task count changes (always in
            // debug mode). Appended to the log only: no origin channel.
            let active = state.tasks.active().len();
            if state.config.supervisor.debug || last_active != Some(active) {
                emit_log_line(&state, "supervisor", format!("supervisor: active_tasks={active}"));
                last_active = Some(active);
            }

            if last_maintenance.elapsed() >= maintenance_every {
                last_maintenance = tokio::time::Instant::now();
                maintenance(&state).await;
            }
        }
    });
}

async fn maintenance(state: &AppState) {
    // ── Expire stale permission requests as deny ────────────────────
    let max_age = Duration::from_secs(state.config.permissions.max_age_s);
    for resolved in state.broker.expire_older_than(max_age) {
        let _ = emit(
            state,
            &resolved.run_id,
            EventKind::PermissionResponse {
                perm_id: resolved.perm_id.clone(),
                decision: PermissionDecision::Deny,
            },
        );
    }

    // ── Task snapshot retention ─────────────────────────────────────
    let tasks_cfg = &state.config.tasks;
    let closed = state
        .tasks
        .auto_close_stale(Duration::from_secs(tasks_cfg.auto_close_after_s));
    let removed = state
        .tasks
        .purge_done(tasks_cfg.keep_done_days, tasks_cfg.keep_done_max);

    // ── Log rotation / pruning ──────────────────────────────────────
    if let Err(e) = state.event_log.prune() {
        tracing::warn!(error = %e, "event log prune failed");
    }
    let audit_rotation = state.config.logs.rotation("memory_events");
    if let Err(e) = state.memory.rotate_audit(&audit_rotation) {
        tracing::warn!(error = %e, "memory audit rotation failed");
    }

    // ── Lazy embedding batch ────────────────────────────────────────
    let mut embedded = 0;
    if let Some(provider) = &state.provider {
        match state.memory.embed_pending(provider.as_ref()).await {
            Ok(n) => embedded = n,
            Err(e) => tracing::debug!(error = %e, "embedding batch failed, will retry"),
        }
    }

    // ── Idle session cleanup ────────────────────────────────────────
    state.sessions.prune_idle();

    if state.config.supervisor.debug || closed > 0 || removed > 0 || embedded > 0 {
        emit_log_line(
            state,
            "supervisor",
            format!(
                "maintenance: tasks_autoclosed={closed} tasks_removed={removed} embeddings_updated={embedded}"
            ),
        );
    }
}
