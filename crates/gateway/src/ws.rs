//! The WebSocket front door.
//!
//! Flow:
//! 1. Client connects to `/ws`.
//! 2. The first frame must be a `connect` request carrying the protocol
//!    version — anything else closes the connection.
//! 3. Request frames dispatch to the method handlers; events from this
//!    channel's runs stream back interleaved with responses.
//!
//! Slash-commands are a gateway concern: text starting with `/` is answered
//! directly and never becomes a run.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};

use ab_domain::event::{EventKind, PermissionDecision, RunKind, RunState};
use ab_protocol::{method, ConnectAck, ConnectParams, Frame, PROTOCOL_VERSION};

use crate::events::{emit, replay_to_channel};
use crate::runtime::runs::Run;
use crate::runtime::scheduler::ScheduleSpec;
use crate::runtime::workers::list_workers;
use crate::state::AppState;

pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // ── Handshake: first frame must be `connect` ─────────────────────
    let (connect_req_id, params) = match wait_for_connect(&mut sink, &mut stream).await {
        Some(p) => p,
        None => return,
    };

    let channel_id = format!("ws:{}", params.device_id);
    let session_key = channel_id.clone();
    let (mut outbound, generation) = state.channels.register(&channel_id);

    let ack = Frame::res_ok(
        connect_req_id,
        serde_json::to_value(ConnectAck::new(env!("CARGO_PKG_VERSION"))).unwrap_or_default(),
    );
    if send_frame(&mut sink, &ack).await.is_err() {
        state.channels.remove(&channel_id, generation);
        return;
    }

    tracing::info!(
        channel = %channel_id,
        client_type = %params.client_type,
        "client connected"
    );

    // ── Writer task: outbound channel → socket ───────────────────────
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    });

    // Re-emit still-pending permission requests for this channel
    // (including channel-less ones from scheduled runs).
    for pending in state.broker.pending_for_channel(&channel_id) {
        state.channels.send(
            &channel_id,
            Frame::synthetic_event(
                &EventKind::RunStatus {
                    status: RunState::WaitingPermission,
                },
                &pending.run_id,
            ),
        );
        state.channels.send(
            &channel_id,
            Frame::synthetic_event(
                &EventKind::PermissionRequest {
                    perm_id: pending.perm_id.clone(),
                    capability: pending.capability.clone(),
                    tool_name: pending.tool_name.clone(),
                    preview: pending.preview.clone(),
                },
                &pending.run_id,
            ),
        );
    }

    // Replay missed events when the client supplies its last seen seq.
    if let Some(last_seq) = params.last_seq {
        let replayed = replay_to_channel(&state, &channel_id, last_seq);
        tracing::debug!(channel = %channel_id, replayed, "event replay complete");
    }

    // ── Reader loop ──────────────────────────────────────────────────
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Req { id, method, params }) => {
                    let response =
                        dispatch(&state, &channel_id, &session_key, &id, &method, params).await;
                    state.channels.send(&channel_id, response);
                }
                Ok(_) => {
                    state
                        .channels
                        .send(&channel_id, Frame::res_err("unknown", "expected a req frame"));
                }
                Err(e) => {
                    state
                        .channels
                        .send(&channel_id, Frame::res_err("unknown", format!("invalid frame: {e}")));
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.channels.remove(&channel_id, generation);
    tracing::info!(channel = %channel_id, "client disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_connect(
    sink: &mut (impl SinkExt<Message> + Unpin),
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(String, ConnectParams)> {
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next())
        .await
        .ok()??;
    let text = match first {
        Ok(Message::Text(t)) => t,
        _ => return None,
    };

    let frame: Frame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(_) => {
            let _ = send_frame(sink, &Frame::res_err("unknown", "invalid request")).await;
            return None;
        }
    };
    let Frame::Req { id, method: m, params } = frame else {
        let _ = send_frame(sink, &Frame::res_err("unknown", "first frame must be a req")).await;
        return None;
    };
    if m != method::CONNECT {
        let _ = send_frame(sink, &Frame::res_err(id, "first frame must be connect")).await;
        return None;
    }
    let params: ConnectParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            let _ = send_frame(sink, &Frame::res_err(id, format!("bad connect params: {e}"))).await;
            return None;
        }
    };
    if params.version != PROTOCOL_VERSION {
        let _ = send_frame(
            sink,
            &Frame::res_err(
                id,
                format!(
                    "unsupported protocol version {} (gateway speaks {PROTOCOL_VERSION})",
                    params.version
                ),
            ),
        )
        .await;
        return None;
    }
    Some((id, params))
}

async fn send_frame(sink: &mut (impl SinkExt<Message> + Unpin), frame: &Frame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn dispatch(
    state: &AppState,
    channel_id: &str,
    session_key: &str,
    req_id: &str,
    m: &str,
    params: Value,
) -> Frame {
    match m {
        method::AGENT => handle_agent(state, channel_id, session_key, req_id, params).await,
        method::RUN_STOP => handle_run_stop(state, session_key, req_id, params),
        method::PERMISSION_RESPOND => handle_permission_respond(state, req_id, params),
        method::MEMORY_SEARCH => {
            let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
            let provider = state
                .provider
                .as_ref()
                .map(|p| p.as_ref() as &dyn ab_providers::LlmProvider);
            match state.memory.search(query, limit, provider).await {
                Ok(items) => Frame::res_ok(req_id, json!({"items": items})),
                Err(e) => Frame::res_err(req_id, e.to_string()),
            }
        }
        method::MEMORY_LIST => {
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
            match state.memory.list_recent(limit).await {
                Ok(items) => Frame::res_ok(
                    req_id,
                    json!({"items": items, "pinned": state.memory.pinned_items()}),
                ),
                Err(e) => Frame::res_err(req_id, e.to_string()),
            }
        }
        method::MEMORY_DELETE => {
            let Some(id) = params.get("id").and_then(|v| v.as_str()) else {
                return Frame::res_err(req_id, "missing id");
            };
            match state.memory.delete(id).await {
                Ok(Some(change)) => {
                    crate::events::emit_memory_change(state, "gateway", &change);
                    Frame::res_ok(req_id, json!({"deleted": id}))
                }
                Ok(None) => Frame::res_err(req_id, format!("no memory item with id {id}")),
                Err(e) => Frame::res_err(req_id, e.to_string()),
            }
        }
        method::MEMORY_PIN => {
            let Some(text) = params.get("text").and_then(|v| v.as_str()) else {
                return Frame::res_err(req_id, "missing text");
            };
            match state.memory.pin(text) {
                Ok(change) => {
                    if let Some(change) = &change {
                        crate::events::emit_memory_change(state, "gateway", change);
                    }
                    Frame::res_ok(req_id, json!({"added": change.is_some()}))
                }
                Err(e) => Frame::res_err(req_id, e.to_string()),
            }
        }
        method::SCHEDULES_LIST => {
            Frame::res_ok(req_id, json!({"schedules": state.schedules.list().await}))
        }
        method::SCHEDULES_CREATE => handle_schedule_create(state, req_id, params).await,
        method::SCHEDULES_UPDATE => handle_schedule_update(state, req_id, params).await,
        method::SCHEDULES_DELETE => {
            let Some(id) = params.get("scheduleId").and_then(|v| v.as_str()) else {
                return Frame::res_err(req_id, "missing scheduleId");
            };
            if state.schedules.delete(id).await {
                Frame::res_ok(req_id, json!({"deleted": id}))
            } else {
                Frame::res_err(req_id, format!("unknown schedule: {id}"))
            }
        }
        method::WORKERS_LIST => Frame::res_ok(req_id, json!({"workers": list_workers(state)})),
        method::STATUS => Frame::res_ok(req_id, crate::api::status_payload(state)),
        other => Frame::res_err(req_id, format!("unknown method: {other}")),
    }
}

async fn handle_agent(
    state: &AppState,
    channel_id: &str,
    session_key: &str,
    req_id: &str,
    params: Value,
) -> Frame {
    let text = params
        .get("message")
        .or_else(|| params.get("input"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if text.trim().is_empty() {
        return Frame::res_err(req_id, "empty message");
    }

    // Gateway command interception.
    if let Some(reply) = crate::commands::handle_command(state, session_key, &text).await {
        state.channels.send(
            channel_id,
            Frame::synthetic_event(&EventKind::RunLog { message: reply }, "gateway"),
        );
        return Frame::res_ok(req_id, json!({"handled": "command"}));
    }

    let run = Run::new(
        channel_id.to_string(),
        Some(channel_id.to_string()),
        session_key.to_string(),
        RunKind::Interactive,
        text,
    );
    match state.sessions.admit(state, run) {
        Ok((run_id, position)) => Frame::res_ok(
            req_id,
            json!({"runId": run_id, "status": "accepted", "queued": position}),
        ),
        Err(e) => Frame::res_err(req_id, e.to_string()),
    }
}

fn handle_run_stop(state: &AppState, session_key: &str, req_id: &str, params: Value) -> Frame {
    let run_id = params
        .get("runId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| state.sessions.latest_run(session_key));
    let Some(run_id) = run_id else {
        return Frame::res_err(req_id, "no active run to stop");
    };
    match crate::runtime::stop_run(state, &run_id) {
        Ok(s) => Frame::res_ok(req_id, json!({"runId": run_id, "state": s})),
        Err(e) => Frame::res_err(req_id, e.to_string()),
    }
}

fn handle_permission_respond(state: &AppState, req_id: &str, params: Value) -> Frame {
    let Some(perm_id) = params.get("requestId").and_then(|v| v.as_str()) else {
        return Frame::res_err(req_id, "missing requestId");
    };
    let decision = match params.get("decision").and_then(|v| v.as_str()) {
        Some("allow") => PermissionDecision::Allow,
        _ => PermissionDecision::Deny,
    };
    let remember = params
        .get("remember")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let Some(resolved) = state.broker.respond(perm_id, decision) else {
        return Frame::res_err(req_id, "unknown or expired permission request");
    };

    let _ = emit(
        state,
        &resolved.run_id,
        EventKind::PermissionResponse {
            perm_id: resolved.perm_id.clone(),
            decision,
        },
    );

    if remember {
        if let Some(capability) = params.get("capability").and_then(|v| v.as_str()) {
            if let Err(e) = state
                .policy
                .persist_decision(&state.config_path, capability, decision)
            {
                tracing::warn!(error = %e, "failed to persist permission decision");
            }
        }
    }

    Frame::res_ok(req_id, json!({"requestId": perm_id}))
}

async fn handle_schedule_create(state: &AppState, req_id: &str, params: Value) -> Frame {
    let spec: ScheduleSpec = match serde_json::from_value(
        params.get("spec").cloned().unwrap_or(Value::Null),
    ) {
        Ok(s) => s,
        Err(e) => return Frame::res_err(req_id, format!("bad spec: {e}")),
    };
    let Some(prompt) = params.get("prompt").and_then(|v| v.as_str()) else {
        return Frame::res_err(req_id, "missing prompt");
    };
    let timezone = params
        .get("timezone")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.scheduler.timezone)
        .to_string();
    let enabled = params
        .get("enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    match state
        .schedules
        .create(spec, prompt.to_string(), timezone, enabled)
        .await
    {
        Ok(schedule) => Frame::res_ok(req_id, json!({"schedule": schedule})),
        Err(e) => Frame::res_err(req_id, e.to_string()),
    }
}

async fn handle_schedule_update(state: &AppState, req_id: &str, params: Value) -> Frame {
    let Some(id) = params.get("scheduleId").and_then(|v| v.as_str()) else {
        return Frame::res_err(req_id, "missing scheduleId");
    };
    let enabled = params.get("enabled").and_then(|v| v.as_bool());
    let prompt = params
        .get("prompt")
        .and_then(|v| v.as_str())
        .map(String::from);

    match state
        .schedules
        .update(id, |s| {
            if let Some(enabled) = enabled {
                s.enabled = enabled;
            }
            if let Some(prompt) = prompt {
                s.prompt = prompt;
            }
        })
        .await
    {
        Some(schedule) => Frame::res_ok(req_id, json!({"schedule": schedule})),
        None => Frame::res_err(req_id, format!("unknown schedule: {id}")),
    }
}
