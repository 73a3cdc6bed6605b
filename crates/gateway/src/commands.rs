//! Gateway slash-commands. Text starting with `/` never reaches the model:
//! the gateway intercepts it and answers directly with a `run.log` frame.

use crate::state::AppState;

const HELP: &str = "Available commands:\n\
/help — this message\n\
/status — gateway, session, and queue status\n\
/stop — stop the latest run in this session\n\
/memory <query> — search long-term memory\n\
/schedules — list schedules";

/// Handle `text` as a gateway command when it starts with `/`.
/// Returns `None` when the text is not a command and should become a run.
pub async fn handle_command(state: &AppState, session_key: &str, text: &str) -> Option<String> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    let reply = match cmd.as_str() {
        "/help" => HELP.to_string(),
        "/status" => status_text(state),
        "/stop" => match state.sessions.latest_run(session_key) {
            Some(run_id) => match crate::runtime::stop_run(state, &run_id) {
                Ok(s) => format!("stopping {run_id} ({s:?})"),
                Err(e) => format!("cannot stop {run_id}: {e}"),
            },
            None => "nothing to stop".to_string(),
        },
        "/memory" => {
            if rest.is_empty() {
                "usage: /memory <query>".to_string()
            } else {
                memory_search_text(state, rest).await
            }
        }
        "/schedules" => schedules_text(state).await,
        other => format!("unknown command: {other}\n\n{HELP}"),
    };
    Some(reply)
}

fn status_text(state: &AppState) -> String {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    let mut out = format!(
        "gateway v{} — uptime {uptime}s, {} connection(s), {} session(s)\n",
        env!("CARGO_PKG_VERSION"),
        state.channels.connection_count(),
        state.sessions.session_count(),
    );
    for s in state.sessions.statuses() {
        out.push_str(&format!(
            "- {}: queue={} active={}\n",
            s.session_key,
            s.queue_depth,
            s.active_run_id.as_deref().unwrap_or("-"),
        ));
    }
    let active_tasks = state.tasks.active();
    out.push_str(&format!("active tasks: {}\n", active_tasks.len()));
    for t in active_tasks.iter().take(10) {
        out.push_str(&format!("- {}: {:?} — {}\n", t.run_id, t.status, t.title));
    }
    out
}

async fn memory_search_text(state: &AppState, query: &str) -> String {
    let provider = state
        .provider
        .as_ref()
        .map(|p| p.as_ref() as &dyn ab_providers::LlmProvider);
    match state.memory.search(query, 8, provider).await {
        Ok(items) if items.is_empty() => "no matching memories".to_string(),
        Ok(items) => {
            let mut out = format!("{} memory hit(s):\n", items.len());
            for item in items {
                out.push_str(&format!("- {} [{}] {}\n", item.item_id, item.kind, item.text));
            }
            out
        }
        Err(e) => format!("memory search failed: {e}"),
    }
}

async fn schedules_text(state: &AppState) -> String {
    let schedules = state.schedules.list().await;
    if schedules.is_empty() {
        return "no schedules".to_string();
    }
    let mut out = format!("{} schedule(s):\n", schedules.len());
    for s in schedules {
        out.push_str(&format!(
            "- {} {:?} enabled={} next={} missed={}\n",
            s.schedule_id,
            s.spec,
            s.enabled,
            s.next_run_at.to_rfc3339(),
            s.missed_count,
        ));
    }
    out
}
