//! Telegram adapter: long-polling `getUpdates` with a persisted offset
//! cursor. Inbound messages become `agent` requests bound to the chat's
//! channel; streamed tokens coalesce into one message edited on a
//! rate-limited cadence; permission requests render as inline Allow/Deny
//! keyboards whose callbacks map to `permission.respond`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ab_domain::event::{EventKind, PermissionDecision, RunKind};
use ab_protocol::Frame;

use crate::events::emit;
use crate::runtime::runs::Run;
use crate::state::AppState;

const POLL_TIMEOUT_S: u64 = 20;

pub fn spawn(state: AppState, token: String) {
    tokio::spawn(async move {
        let client = Arc::new(TelegramClient::new(
            state.config.adapters.telegram.api_base.clone(),
            token,
        ));
        poll_loop(state, client).await;
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bot API client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TelegramClient {
    base: String,
    http: reqwest::Client,
}

impl TelegramClient {
    fn new(api_base: String, token: String) -> Self {
        let base = format!("{}/bot{}", api_base.trim_end_matches('/'), token);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_S + 10))
            .build()
            .unwrap_or_default();
        Self { base, http }
    }

    async fn call(&self, method: &str, body: Value) -> Option<Value> {
        let url = format!("{}/{method}", self.base);
        let resp = self.http.post(&url).json(&body).send().await.ok()?;
        let v: Value = resp.json().await.ok()?;
        if v.get("ok").and_then(|o| o.as_bool()) != Some(true) {
            tracing::debug!(method, response = %v, "telegram API call not ok");
            return None;
        }
        v.get("result").cloned()
    }

    async fn get_updates(&self, offset: Option<i64>) -> Vec<Value> {
        let mut body = json!({"timeout": POLL_TIMEOUT_S, "allowed_updates": ["message", "callback_query"]});
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body)
            .await
            .and_then(|r| r.as_array().cloned())
            .unwrap_or_default()
    }

    async fn send_message(&self, chat_id: i64, text: &str, reply_markup: Option<Value>) -> Option<i64> {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }
        self.call("sendMessage", body)
            .await
            .and_then(|r| r.get("message_id").and_then(|v| v.as_i64()))
    }

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) {
        let _ = self
            .call(
                "editMessageText",
                json!({"chat_id": chat_id, "message_id": message_id, "text": text}),
            )
            .await;
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) {
        let _ = self
            .call(
                "answerCallbackQuery",
                json!({"callback_query_id": callback_id, "text": text}),
            )
            .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offset cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn offset_path(state: &AppState) -> PathBuf {
    state.config.data.dir.join("telegram_offset.json")
}

fn load_offset(state: &AppState) -> Option<i64> {
    let raw = std::fs::read_to_string(offset_path(state)).ok()?;
    let v: Value = serde_json::from_str(&raw).ok()?;
    v.get("offset").and_then(|o| o.as_i64())
}

fn save_offset(state: &AppState, offset: i64) {
    let path = offset_path(state);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&path, json!({"offset": offset}).to_string()) {
        tracing::warn!(error = %e, "failed to persist telegram offset");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Poll loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn poll_loop(state: AppState, client: Arc<TelegramClient>) {
    let mut offset = load_offset(&state);
    let idle_sleep = Duration::from_secs(state.config.adapters.telegram.poll_interval_s.max(1));
    tracing::info!("telegram poller started");

    loop {
        let updates = client.get_updates(offset).await;
        if updates.is_empty() {
            tokio::time::sleep(idle_sleep).await;
            continue;
        }
        for update in updates {
            let update_id = update.get("update_id").and_then(|v| v.as_i64()).unwrap_or(0);
            handle_update(&state, &client, &update).await;
            offset = Some(update_id + 1);
            save_offset(&state, update_id + 1);
        }
    }
}

async fn handle_update(state: &AppState, client: &Arc<TelegramClient>, update: &Value) {
    // Inline keyboard callbacks carry "perm:<perm_id>:<allow|deny>".
    if let Some(cb) = update.get("callback_query") {
        let callback_id = cb.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let data = cb.get("data").and_then(|v| v.as_str()).unwrap_or("");
        let mut parts = data.splitn(3, ':');
        if parts.next() == Some("perm") {
            let perm_id = parts.next().unwrap_or("");
            let decision = if parts.next() == Some("allow") {
                PermissionDecision::Allow
            } else {
                PermissionDecision::Deny
            };
            match state.broker.respond(perm_id, decision) {
                Some(resolved) => {
                    let _ = emit(
                        state,
                        &resolved.run_id,
                        EventKind::PermissionResponse {
                            perm_id: resolved.perm_id.clone(),
                            decision,
                        },
                    );
                    client.answer_callback(callback_id, "recorded").await;
                }
                None => {
                    client.answer_callback(callback_id, "expired").await;
                }
            }
        } else {
            client.answer_callback(callback_id, "unsupported").await;
        }
        return;
    }

    let Some(msg) = update.get("message") else { return };
    let Some(chat_id) = msg
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_i64())
    else {
        return;
    };
    let text = msg
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if text.is_empty() {
        return;
    }

    let channel_id = format!("telegram:{chat_id}");
    ensure_renderer(state, client, &channel_id, chat_id);

    // Gateway command interception, same rule as the WS path.
    if let Some(reply) = crate::commands::handle_command(state, &channel_id, &text).await {
        let _ = client.send_message(chat_id, &reply, None).await;
        return;
    }

    let run = Run::new(
        channel_id.clone(),
        Some(channel_id.clone()),
        channel_id.clone(),
        RunKind::Interactive,
        text,
    );
    match state.sessions.admit(state, run) {
        Ok((run_id, position)) => {
            tracing::info!(chat_id, run_id = %run_id, "telegram run accepted");
            if position > 0 {
                let _ = client
                    .send_message(chat_id, &format!("queued at position {position}"), None)
                    .await;
            }
        }
        Err(e) => {
            let _ = client.send_message(chat_id, &format!("rejected: {e}"), None).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Renderer — events → rate-limited message edits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Register the chat's channel and spawn its renderer once. Re-registering
/// an already-live chat would cut off the existing renderer, so only the
/// first message of a chat does this.
fn ensure_renderer(state: &AppState, client: &Arc<TelegramClient>, channel_id: &str, chat_id: i64) {
    if state.channels.is_connected(channel_id) {
        return;
    }
    let (rx, _generation) = state.channels.register(channel_id);
    let client = client.clone();
    let edit_interval = Duration::from_millis(state.config.adapters.telegram.edit_interval_ms);
    tokio::spawn(async move {
        render_loop(client, chat_id, rx, edit_interval).await;
    });
}

#[derive(Default)]
struct RunView {
    buffer: String,
    message_id: Option<i64>,
    dirty: bool,
}

async fn render_loop(
    client: Arc<TelegramClient>,
    chat_id: i64,
    mut rx: mpsc::Receiver<Frame>,
    edit_interval: Duration,
) {
    let mut views: HashMap<String, RunView> = HashMap::new();
    let mut flush = tokio::time::interval(edit_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                handle_frame(&client, chat_id, &mut views, frame).await;
            }
            _ = flush.tick() => {
                // Rate-limited edit cadence: one edit per run per interval.
                for view in views.values_mut() {
                    if view.dirty && !view.buffer.is_empty() {
                        push_view(&client, chat_id, view).await;
                    }
                }
            }
        }
    }
    tracing::debug!(chat_id, "telegram renderer stopped");
}

async fn push_view(client: &TelegramClient, chat_id: i64, view: &mut RunView) {
    match view.message_id {
        Some(message_id) => client.edit_message(chat_id, message_id, &view.buffer).await,
        None => view.message_id = client.send_message(chat_id, &view.buffer, None).await,
    }
    view.dirty = false;
}

async fn handle_frame(
    client: &Arc<TelegramClient>,
    chat_id: i64,
    views: &mut HashMap<String, RunView>,
    frame: Frame,
) {
    let Frame::Event { event, payload, .. } = frame else {
        return;
    };
    let run_id = payload
        .get("runId")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    match event.as_str() {
        "token" => {
            if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                let view = views.entry(run_id).or_default();
                view.buffer.push_str(text);
                view.dirty = true;
            }
        }
        "run.final" => {
            if let Some(view) = views.get_mut(&run_id) {
                if view.buffer.is_empty() {
                    let state_str = payload.get("state").and_then(|v| v.as_str()).unwrap_or("done");
                    view.buffer = format!("[{state_str}]");
                }
                push_view(client, chat_id, view).await;
            }
            views.remove(&run_id);
        }
        "permission.request" => {
            let perm_id = payload.get("perm_id").and_then(|v| v.as_str()).unwrap_or("");
            let capability = payload.get("capability").and_then(|v| v.as_str()).unwrap_or("?");
            let preview = payload.get("preview").and_then(|v| v.as_str()).unwrap_or("");
            let keyboard = json!({
                "inline_keyboard": [[
                    {"text": "Allow", "callback_data": format!("perm:{perm_id}:allow")},
                    {"text": "Deny", "callback_data": format!("perm:{perm_id}:deny")},
                ]]
            });
            let _ = client
                .send_message(
                    chat_id,
                    &format!("Permission needed: {capability}\n{preview}"),
                    Some(keyboard),
                )
                .await;
        }
        "tool.call" => {
            if let Some(tool) = payload.get("tool_name").and_then(|v| v.as_str()) {
                let _ = client
                    .send_message(chat_id, &format!("⚙ running {tool}…"), None)
                    .await;
            }
        }
        "run.log" => {
            if let Some(message) = payload.get("message").and_then(|v| v.as_str()) {
                let _ = client.send_message(chat_id, message, None).await;
            }
        }
        _ => {}
    }
}
