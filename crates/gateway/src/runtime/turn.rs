//! The run executor — drives one run from admission to its terminal state:
//! context packet, streaming LLM loop, permission-gated tool dispatch,
//! event emission, and cooperative cancellation.

use std::time::Duration;

use futures_util::StreamExt;

use ab_domain::error::Error;
use ab_domain::event::{EventKind, PermissionDecision, RunKind, RunState};
use ab_domain::stream::{StreamEvent, Usage};
use ab_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use ab_providers::{Backoff, ChatRequest, EmbeddingsRequest, LlmProvider};

use crate::events::{emit, emit_memory_change};
use crate::prompts;
use crate::runtime::tools::{self, ToolContext};
use crate::runtime::workers::ResultEnvelope;
use crate::state::AppState;

/// Tool-call loop iterations before the run is force-failed.
const MAX_TOOL_LOOPS: usize = 25;
/// Individual tool call timeout.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(300);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute a run to completion. Never panics and never leaves the run
/// non-terminal: every exit path lands in exactly one `run.final`.
pub async fn execute_run(state: &AppState, run_id: &str) {
    let Some(run) = state.runs.get(run_id) else {
        tracing::warn!(run_id, "executor asked to run an unknown run");
        return;
    };
    if run.state.is_terminal() {
        return;
    }
    // Stopped while still queued, after the pump already popped it.
    if run.state == RunState::Stopping {
        finalize(state, run_id, RunState::Stopped, None, None, Some("stopped before start".into())).await;
        return;
    }

    state.runs.set_state(run_id, RunState::Running);
    let _ = emit(state, run_id, EventKind::RunStatus { status: RunState::Running });
    let _ = emit(
        state,
        run_id,
        EventKind::RunInput {
            input: run.input_text.clone(),
        },
    );
    state.tasks.upsert_from_run(run_id, &run.input_text);

    let cancel = state.cancels.register(run_id);
    if let Some(parent) = &run.parent_run_id {
        state.cancels.add_child(parent, run_id);
    }

    let span = tracing::info_span!("run", run_id = %run_id, session = %run.session_key);

    let Some(provider) = state.provider.clone() else {
        finalize(
            state,
            run_id,
            RunState::Failed,
            None,
            Some(Error::Config("no LLM provider configured".into())),
            None,
        )
        .await;
        return;
    };

    let outcome = tracing::Instrument::instrument(
        run_loop(
            state,
            run_id,
            provider.as_ref(),
            &cancel,
            &run.input_text,
            &run.session_key,
            run.origin_channel.clone(),
            run.depth,
        ),
        span,
    )
    .await;

    match outcome {
        LoopOutcome::Done { text, usage } => {
            finalize_success(state, run_id, &run.session_key, &run.input_text, text, usage).await;
        }
        LoopOutcome::Stopped { partial } => {
            finalize(state, run_id, RunState::Stopped, None, None, Some(stop_reason(&partial))).await;
        }
        LoopOutcome::Failed { error, usage } => {
            finalize(state, run_id, RunState::Failed, usage, Some(error), None).await;
        }
    }
}

fn stop_reason(partial: &str) -> String {
    if partial.is_empty() {
        "stopped by user".to_string()
    } else {
        format!("stopped by user after {} chars", partial.len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum LoopOutcome {
    Done { text: String, usage: Usage },
    Stopped { partial: String },
    Failed { error: Error, usage: Option<Usage> },
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    state: &AppState,
    run_id: &str,
    provider: &dyn LlmProvider,
    cancel: &crate::runtime::cancel::CancelToken,
    input_text: &str,
    session_key: &str,
    origin_channel: Option<String>,
    depth: u32,
) -> LoopOutcome {
    let ctx = ToolContext {
        run_id: run_id.to_string(),
        origin_channel: origin_channel.clone(),
        depth,
    };

    // ── Context packet ───────────────────────────────────────────────
    let query_embedding = embed_query(state, provider, input_text).await;
    let packet = match state
        .memory
        .build_packet(session_key, input_text, query_embedding.as_deref())
        .await
    {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "memory packet build failed, continuing without");
            Default::default()
        }
    };

    let mut messages = Vec::new();
    messages.push(Message::system(prompts::build_system_prompt(state, &packet)));
    for turn in &packet.recent_turns {
        messages.push(Message::user(&turn.user_text));
        messages.push(Message::assistant(&turn.assistant_text));
    }
    messages.push(Message::user(input_text));

    let tool_defs = tools::build_tool_definitions();
    let mut total_usage = Usage::default();
    let turn_deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.config.llm.turn_timeout_s);

    for loop_idx in 0..MAX_TOOL_LOOPS {
        tracing::debug!(loop_idx, "tool loop iteration");
        if cancel.is_cancelled() {
            return LoopOutcome::Stopped { partial: String::new() };
        }

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(state.config.llm.temperature),
            max_tokens: None,
            json_mode: false,
            model: None,
        };

        // ── Open the stream (retried with bounded backoff) ───────────
        let mut stream = {
            let mut backoff = Backoff::for_provider();
            loop {
                match provider.chat_stream(&req).await {
                    Ok(s) => break s,
                    Err(e) if is_retryable(&e) => match backoff.next_delay() {
                        Some(delay) => {
                            tracing::warn!(error = %e, "stream open failed, retrying");
                            tokio::time::sleep(delay).await;
                            if cancel.is_cancelled() {
                                return LoopOutcome::Stopped { partial: String::new() };
                            }
                        }
                        None => {
                            return LoopOutcome::Failed { error: e, usage: Some(total_usage) };
                        }
                    },
                    Err(e) => return LoopOutcome::Failed { error: e, usage: Some(total_usage) },
                }
            }
        };

        // ── Consume chunks ───────────────────────────────────────────
        let mut text_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut turn_usage: Option<Usage> = None;
        let mut was_cancelled = false;

        loop {
            let remaining = turn_deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return LoopOutcome::Failed {
                    error: Error::Timeout(format!(
                        "turn exceeded {}s",
                        state.config.llm.turn_timeout_s
                    )),
                    usage: Some(total_usage),
                };
            }

            let next = match tokio::time::timeout(remaining, stream.next()).await {
                Ok(n) => n,
                Err(_) => {
                    return LoopOutcome::Failed {
                        error: Error::Timeout(format!(
                            "turn exceeded {}s",
                            state.config.llm.turn_timeout_s
                        )),
                        usage: Some(total_usage),
                    };
                }
            };
            let Some(event_result) = next else { break };

            // Cancellation is observed at chunk boundaries; the stream is
            // closed by dropping it.
            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }

            let event = match event_result {
                Ok(ev) => ev,
                Err(e) => {
                    return LoopOutcome::Failed { error: e, usage: Some(total_usage) };
                }
            };
            match event {
                StreamEvent::Token { text } => {
                    let _ = emit(state, run_id, EventKind::Token { text: text.clone() });
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {
                    // Assembly happens in the provider adapter; only the
                    // finished call matters here.
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    pending_tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { usage, .. } => {
                    turn_usage = usage;
                }
                StreamEvent::Error { message } => {
                    return LoopOutcome::Failed {
                        error: Error::Provider {
                            provider: provider.provider_id().to_string(),
                            message,
                        },
                        usage: Some(total_usage),
                    };
                }
            }
        }
        drop(stream);

        if let Some(u) = &turn_usage {
            total_usage.add(u);
        }
        if was_cancelled || cancel.is_cancelled() {
            return LoopOutcome::Stopped { partial: text_buf };
        }

        // No tool calls: the accumulated text is the final answer.
        if pending_tool_calls.is_empty() {
            return LoopOutcome::Done { text: text_buf, usage: total_usage };
        }

        // ── Tool dispatch (serial: the model dictates tool order) ────
        messages.push(build_assistant_tool_message(&text_buf, &pending_tool_calls));

        for tc in &pending_tool_calls {
            if cancel.is_cancelled() {
                return LoopOutcome::Stopped { partial: text_buf };
            }
            match gated_tool_call(state, run_id, &ctx, cancel, tc).await {
                (ToolCallResult::Result(content), is_error) => {
                    messages.push(Message::tool_result(&tc.call_id, &content, is_error));
                }
                (ToolCallResult::RunStopped, _) => {
                    return LoopOutcome::Stopped { partial: text_buf };
                }
            }
        }

        if loop_idx == MAX_TOOL_LOOPS - 1 {
            return LoopOutcome::Failed {
                error: Error::Other(format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)")),
                usage: Some(total_usage),
            };
        }
    }

    LoopOutcome::Failed {
        error: Error::Other("tool loop ended unexpectedly".into()),
        usage: Some(total_usage),
    }
}

enum ToolCallResult {
    Result(String),
    RunStopped,
}

/// Route one tool call through the permission broker, then execute it.
/// Denials and tool failures come back as error-tagged results; the run
/// continues either way.
async fn gated_tool_call(
    state: &AppState,
    run_id: &str,
    ctx: &ToolContext,
    cancel: &crate::runtime::cancel::CancelToken,
    tc: &ToolCall,
) -> (ToolCallResult, bool) {
    let Some(spec) = tools::find(&tc.tool_name) else {
        let msg = format!("unknown tool: {}", tc.tool_name);
        let _ = emit(
            state,
            run_id,
            EventKind::ToolCall {
                call_id: tc.call_id.clone(),
                tool_name: tc.tool_name.clone(),
                arguments: tc.arguments.clone(),
            },
        );
        emit_tool_result(state, run_id, tc, &msg, true);
        return (ToolCallResult::Result(msg), true);
    };

    let capability = tools::capability_for(spec, &tc.arguments);
    let preview = tools::preview_for(spec, &tc.arguments);

    match state.policy.check(&capability, &preview) {
        crate::runtime::permissions::PolicyVerdict::Deny => {
            let msg = format!("denied by policy: {capability}");
            let _ = emit(
                state,
                run_id,
                EventKind::ToolCall {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                },
            );
            emit_tool_result(state, run_id, tc, &msg, true);
            return (ToolCallResult::Result(msg), true);
        }
        crate::runtime::permissions::PolicyVerdict::Ask => {
            state.runs.set_state(run_id, RunState::WaitingPermission);
            state.tasks.set_status(run_id, RunState::WaitingPermission);
            let _ = emit(
                state,
                run_id,
                EventKind::RunStatus {
                    status: RunState::WaitingPermission,
                },
            );
            let (info, rx) = state.broker.request(
                run_id,
                ctx.origin_channel.clone(),
                &capability,
                &tc.tool_name,
                &preview,
            );
            let _ = emit(
                state,
                run_id,
                EventKind::PermissionRequest {
                    perm_id: info.perm_id.clone(),
                    capability: capability.clone(),
                    tool_name: tc.tool_name.clone(),
                    preview: preview.clone(),
                },
            );

            // Resolved by a client response, expiry, or the stop path.
            let decision = rx.await.unwrap_or(PermissionDecision::Deny);

            if cancel.is_cancelled() {
                return (ToolCallResult::RunStopped, true);
            }
            state.runs.set_state(run_id, RunState::Running);
            state.tasks.set_status(run_id, RunState::Running);
            let _ = emit(
                state,
                run_id,
                EventKind::RunStatus {
                    status: RunState::Running,
                },
            );

            if decision == PermissionDecision::Deny {
                let msg = format!("denied by user: {capability}");
                let _ = emit(
                    state,
                    run_id,
                    EventKind::ToolCall {
                        call_id: tc.call_id.clone(),
                        tool_name: tc.tool_name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                );
                emit_tool_result(state, run_id, tc, &msg, true);
                return (ToolCallResult::Result(msg), true);
            }
        }
        crate::runtime::permissions::PolicyVerdict::Allow => {}
    }

    // Approved: execute with the per-call timeout.
    let _ = emit(
        state,
        run_id,
        EventKind::ToolCall {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
            arguments: tc.arguments.clone(),
        },
    );
    let (content, is_error) =
        match tokio::time::timeout(TOOL_CALL_TIMEOUT, tools::dispatch(state, ctx, &tc.tool_name, &tc.arguments)).await {
            Ok(result) => result,
            Err(_) => (
                format!("tool timed out after {}s", TOOL_CALL_TIMEOUT.as_secs()),
                true,
            ),
        };
    emit_tool_result(state, run_id, tc, &content, is_error);
    (ToolCallResult::Result(content), is_error)
}

fn emit_tool_result(state: &AppState, run_id: &str, tc: &ToolCall, content: &str, is_error: bool) {
    let _ = emit(
        state,
        run_id,
        EventKind::ToolResult {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
            content: content.to_string(),
            is_error,
        },
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn finalize_success(
    state: &AppState,
    run_id: &str,
    session_key: &str,
    input_text: &str,
    text: String,
    usage: Usage,
) {
    finalize(state, run_id, RunState::Done, Some(usage), None, None).await;

    // Memory ingestion is fire-and-forget: retrieval must never wait on it.
    let effective = state.runs.get(run_id).map(|r| r.state);
    if effective == Some(RunState::Done) {
        let state = state.clone();
        let run_id = run_id.to_string();
        let session_key = session_key.to_string();
        let input_text = input_text.to_string();
        tokio::spawn(async move {
            let provider = state
                .provider
                .as_ref()
                .map(|p| p.as_ref() as &dyn LlmProvider);
            match state
                .memory
                .ingest(&run_id, &session_key, &input_text, &text, provider)
                .await
            {
                Ok(changes) => {
                    for change in &changes {
                        emit_memory_change(&state, &run_id, change);
                    }
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "memory ingest failed");
                }
            }
        });
    }
}

/// Resolve the terminal state (earliest decision wins), emit the final
/// status + `run.final`, and release per-run resources.
async fn finalize(
    state: &AppState,
    run_id: &str,
    desired: RunState,
    usage: Option<Usage>,
    error: Option<Error>,
    stop_reason: Option<String>,
) {
    let error_kind = error.as_ref().map(|e| e.kind().to_string());
    let error_msg = error.map(|e| e.to_string());

    let outcome = state
        .runs
        .finish(run_id, desired, error_msg.clone());
    let effective = match outcome {
        Some(crate::runtime::runs::FinishOutcome::Finished(s)) => s,
        Some(crate::runtime::runs::FinishOutcome::AlreadyTerminal(_)) | None => {
            // Someone else already finalized: exactly one run.final rule.
            state.cancels.remove(run_id);
            return;
        }
    };

    let _ = emit(state, run_id, EventKind::RunStatus { status: effective });
    let stop_reason = if effective == RunState::Stopped {
        Some(stop_reason.unwrap_or_else(|| "stopped by user".into()))
    } else {
        None
    };
    let _ = emit(
        state,
        run_id,
        EventKind::RunFinal {
            state: effective,
            usage,
            error: error_msg.clone(),
            error_kind,
            stop_reason,
        },
    );

    state.tasks.mark_finished(run_id, effective);
    state.cancels.remove(run_id);

    // Workers hand their envelope back to the awaiting parent.
    if let Some(run) = state.runs.get(run_id) {
        if run.kind == RunKind::Worker {
            let summary = final_text_for(state, run_id);
            let envelope = ResultEnvelope {
                summary,
                artifacts: Vec::new(),
                errors: error_msg.into_iter().collect(),
                state: effective,
            };
            state.workers.complete(run_id, envelope);
        }
    }
}

/// Reconstruct a run's final assistant text from its token events.
fn final_text_for(state: &AppState, run_id: &str) -> String {
    match state.event_log.run_events(run_id, 0, 10_000) {
        Ok(events) => events
            .into_iter()
            .filter_map(|r| match r.event {
                EventKind::Token { text } => Some(text),
                _ => None,
            })
            .collect(),
        Err(_) => String::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_retryable(e: &Error) -> bool {
    matches!(e, Error::Http(_) | Error::Timeout(_))
}

async fn embed_query(
    state: &AppState,
    provider: &dyn LlmProvider,
    query: &str,
) -> Option<Vec<f32>> {
    if !state.config.memory.embeddings.enabled {
        return None;
    }
    let req = EmbeddingsRequest {
        input: vec![query.to_string()],
        model: Some(state.config.memory.embeddings.model.clone()),
    };
    match provider.embeddings(req).await {
        Ok(mut resp) if !resp.embeddings.is_empty() => Some(resp.embeddings.swap_remove(0)),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "query embedding unavailable");
            None
        }
    }
}

fn build_assistant_tool_message(text: &str, tool_calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }
    for tc in tool_calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}
