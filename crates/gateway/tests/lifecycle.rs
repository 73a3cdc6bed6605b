//! End-to-end lifecycle tests: a scripted provider drives real runs through
//! the session queue, executor, permission broker, and event log.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ab_domain::config::Config;
use ab_domain::error::{Error, Result};
use ab_domain::event::{EventKind, PermissionDecision, RunKind, RunState};
use ab_domain::stream::{BoxStream, StreamEvent, Usage};
use ab_providers::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};

use ab_gateway::bootstrap;
use ab_gateway::runtime::runs::Run;
use ab_gateway::runtime::scheduler::ScheduleSpec;
use ab_gateway::runtime::{self, tools::ToolContext, workers};
use ab_gateway::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted stream: events yielded in order with an optional pause
/// before each, so tests can interleave stops with chunks.
type Script = Vec<(Option<Duration>, StreamEvent)>;

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }

    fn immediate(events: Vec<StreamEvent>) -> Script {
        events.into_iter().map(|e| (None, e)).collect()
    }

    fn done_event() -> StreamEvent {
        StreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: Some("stop".into()),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        // Only the memory extractor uses non-streaming chat in these tests.
        Ok(ChatResponse {
            content: r#"{"memories": []}"#.into(),
            tool_calls: vec![],
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Provider {
                provider: "scripted".into(),
                message: "script exhausted".into(),
            })?;
        let stream = async_stream::stream! {
            for (pause, event) in script {
                if let Some(pause) = pause {
                    tokio::time::sleep(pause).await;
                }
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Http("no embeddings in scripted provider".into()))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_state(dir: &std::path::Path, scripts: Vec<Script>) -> AppState {
    let mut config = Config::default();
    config.data.dir = dir.join("data");
    config.memory.dir = dir.join("memory");
    config.memory.embeddings.enabled = false;
    config.sessions.queue_soft_cap = 2;

    let mut state = bootstrap::build_app_state(
        Arc::new(config),
        PathBuf::from(dir.join("agent_blob.toml")),
    )
    .expect("state boots");
    state.provider = Some(Arc::new(ScriptedProvider::new(scripts)));
    state
}

fn interactive_run(channel: &str, input: &str) -> Run {
    Run::new(
        channel.to_string(),
        Some(channel.to_string()),
        channel.to_string(),
        RunKind::Interactive,
        input,
    )
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn run_event_names(state: &AppState, run_id: &str) -> Vec<&'static str> {
    state
        .event_log
        .run_events(run_id, 0, 1000)
        .unwrap()
        .iter()
        .map(|r| r.event.name())
        .collect()
}

fn terminal_state(state: &AppState, run_id: &str) -> Option<RunState> {
    state
        .event_log
        .run_events(run_id, 0, 1000)
        .unwrap()
        .into_iter()
        .find_map(|r| match r.event {
            EventKind::RunFinal { state, .. } => Some(state),
            _ => None,
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(flavor = "multi_thread")]
async fn plain_turn_ends_in_single_final() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "hello ".into() },
            StreamEvent::Token { text: "there".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    let (run_id, position) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "hi"))
        .unwrap();
    assert_eq!(position, 0);

    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;
    assert_eq!(terminal_state(&state, &run_id), Some(RunState::Done));

    let names = run_event_names(&state, &run_id);
    assert_eq!(names.iter().filter(|n| **n == "run.final").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "token").count(), 2);
    // run.final is the last event of the run.
    assert_eq!(*names.last().unwrap(), "run.final");
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_ask_allow_runs_shell_tool() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![
            ScriptedProvider::immediate(vec![
                StreamEvent::ToolCallFinished {
                    call_id: "call_1".into(),
                    tool_name: "shell_run".into(),
                    arguments: serde_json::json!({"command": "echo hi"}),
                },
                ScriptedProvider::done_event(),
            ]),
            ScriptedProvider::immediate(vec![
                StreamEvent::Token { text: "ran it".into() },
                ScriptedProvider::done_event(),
            ]),
        ],
    );

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "run echo hi in shell"))
        .unwrap();

    // A human answers the shell.run ask with allow.
    wait_for(|| state.broker.pending_count() > 0, "permission request").await;
    let pending = state.broker.pending_for_channel("ws:a");
    assert_eq!(pending[0].capability, "shell.run");
    assert_eq!(pending[0].preview, "echo hi");
    state
        .broker
        .respond(&pending[0].perm_id, PermissionDecision::Allow);

    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;
    assert_eq!(terminal_state(&state, &run_id), Some(RunState::Done));

    let events = state.event_log.run_events(&run_id, 0, 1000).unwrap();
    let names: Vec<&str> = events.iter().map(|r| r.event.name()).collect();
    let pos = |name: &str| names.iter().position(|n| *n == name).unwrap();
    assert!(pos("permission.request") < pos("tool.call"));
    assert!(pos("tool.call") < pos("tool.result"));
    assert!(pos("tool.result") < pos("token"));

    // The shell actually ran: its stdout is in the tool result.
    let tool_result = events
        .iter()
        .find_map(|r| match &r.event {
            EventKind::ToolResult { content, is_error, .. } => Some((content.clone(), *is_error)),
            _ => None,
        })
        .unwrap();
    assert!(!tool_result.1);
    assert!(tool_result.0.contains("hi"));
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_write_is_reclassified_before_matching() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![
            ScriptedProvider::immediate(vec![
                StreamEvent::ToolCallFinished {
                    call_id: "call_1".into(),
                    tool_name: "shell_run".into(),
                    arguments: serde_json::json!({"command": "echo hi > tmp/test.txt"}),
                },
                ScriptedProvider::done_event(),
            ]),
            ScriptedProvider::immediate(vec![
                StreamEvent::Token { text: "ok".into() },
                ScriptedProvider::done_event(),
            ]),
        ],
    );

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "write a file via shell"))
        .unwrap();

    wait_for(|| state.broker.pending_count() > 0, "permission request").await;
    let pending = state.broker.pending_for_channel("ws:a");
    // The broker saw shell.write, not shell.run.
    assert_eq!(pending[0].capability, "shell.write");
    state
        .broker
        .respond(&pending[0].perm_id, PermissionDecision::Deny);

    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;
    // Denial is a tool-level error; the run still completes.
    assert_eq!(terminal_state(&state, &run_id), Some(RunState::Done));

    let events = state.event_log.run_events(&run_id, 0, 1000).unwrap();
    let denied = events.iter().any(|r| {
        matches!(&r.event, EventKind::ToolResult { content, is_error, .. }
            if *is_error && content.contains("denied by user"))
    });
    assert!(denied);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_stream_yields_stopped() {
    let dir = tempfile::tempdir().unwrap();
    // Three quick tokens, then a long-paused tail the stop should cut off.
    let mut script = ScriptedProvider::immediate(vec![
        StreamEvent::Token { text: "a".into() },
        StreamEvent::Token { text: "b".into() },
        StreamEvent::Token { text: "c".into() },
    ]);
    for _ in 0..20 {
        script.push((
            Some(Duration::from_millis(200)),
            StreamEvent::Token { text: "late".into() },
        ));
    }
    script.push((None, ScriptedProvider::done_event()));
    let state = test_state(dir.path(), vec![script]);

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "write a long essay"))
        .unwrap();

    wait_for(
        || {
            run_event_names(&state, &run_id)
                .iter()
                .filter(|n| **n == "token")
                .count()
                >= 3
        },
        "three tokens",
    )
    .await;

    runtime::stop_run(&state, &run_id).unwrap();
    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;

    assert_eq!(terminal_state(&state, &run_id), Some(RunState::Stopped));
    let events = state.event_log.run_events(&run_id, 0, 1000).unwrap();
    // No token event after the stopped status.
    let stopped_at = events
        .iter()
        .position(|r| {
            matches!(&r.event, EventKind::RunStatus { status } if *status == RunState::Stopped)
        })
        .unwrap();
    assert!(events[stopped_at..]
        .iter()
        .all(|r| !matches!(r.event, EventKind::Token { .. })));
    // Far fewer than the scripted 23 tokens made it out.
    let token_count = events
        .iter()
        .filter(|r| matches!(r.event, EventKind::Token { .. }))
        .count();
    assert!(token_count < 10, "saw {token_count} tokens");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_and_terminal_stop_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "x".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "quick"))
        .unwrap();
    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;

    // Stop after done is a state conflict; the state is unchanged.
    let err = runtime::stop_run(&state, &run_id).unwrap_err();
    assert!(matches!(err, Error::StateConflict(_)));
    assert_eq!(state.runs.get(&run_id).unwrap().state, RunState::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_full_rejects_without_changing_queue() {
    let dir = tempfile::tempdir().unwrap();
    // One slow run keeps the session busy; soft cap is 2.
    let mut scripts = Vec::new();
    for _ in 0..4 {
        scripts.push(vec![
            (
                Some(Duration::from_millis(400)),
                StreamEvent::Token { text: "slow".into() },
            ),
            (None, ScriptedProvider::done_event()),
        ]);
    }
    let state = test_state(dir.path(), scripts);

    let (first, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "one"))
        .unwrap();
    wait_for(
        || state.runs.get(&first).map(|r| r.state == RunState::Running).unwrap_or(false),
        "first run running",
    )
    .await;

    // Two queued behind the running one fills the cap.
    state
        .sessions
        .admit(&state, interactive_run("ws:a", "two"))
        .unwrap();
    state
        .sessions
        .admit(&state, interactive_run("ws:a", "three"))
        .unwrap();

    let err = state
        .sessions
        .admit(&state, interactive_run("ws:a", "four"))
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert!(err.to_string().contains("queue_full"));

    // Queue depth unchanged: running + 2 queued.
    let status = state
        .sessions
        .statuses()
        .into_iter()
        .find(|s| s.session_key == "ws:a")
        .unwrap();
    assert_eq!(status.queue_depth, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_isolation_no_cross_channel_events() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "secret".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    let (mut rx_a, _) = state.channels.register("ws:a");
    let (mut rx_b, _) = state.channels.register("ws:b");

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "hello"))
        .unwrap();
    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;

    // A saw events for its run.
    let mut a_got_any = false;
    while let Ok(frame) = rx_a.try_recv() {
        if let ab_protocol::Frame::Event { payload, .. } = frame {
            assert_eq!(payload["runId"], run_id.as_str());
            a_got_any = true;
        }
    }
    assert!(a_got_any);

    // B saw nothing at all.
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_after_reconnect_delivers_missed_events() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "while you were away".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    // Run completes with the channel disconnected.
    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "hello"))
        .unwrap();
    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;

    // Reconnect and replay from seq 0.
    let (mut rx, _) = state.channels.register("ws:a");
    let replayed = ab_gateway::events::replay_to_channel(&state, "ws:a", 0);
    assert!(replayed > 0);

    let mut saw_final = false;
    while let Ok(frame) = rx.try_recv() {
        if let ab_protocol::Frame::Event { event, payload, .. } = frame {
            assert_eq!(payload["runId"], run_id.as_str());
            if event == "run.final" {
                saw_final = true;
            }
        }
    }
    assert!(saw_final);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_fires_and_advances() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "scheduled work".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    let schedule = state
        .schedules
        .create(
            ScheduleSpec::Interval { seconds: 3600 },
            "do the rounds".into(),
            "UTC".into(),
            true,
        )
        .await
        .unwrap();
    // Force it due.
    state
        .schedules
        .update(&schedule.schedule_id, |s| {
            s.next_run_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        })
        .await;

    ab_gateway::runtime::scheduler::tick(&state).await;

    let after = state.schedules.get(&schedule.schedule_id).await.unwrap();
    let run_id = after.last_run_id.clone().expect("schedule fired");
    assert!(after.next_run_at > chrono::Utc::now());

    wait_for(|| terminal_state(&state, &run_id).is_some(), "scheduled run final").await;
    let run = state.runs.get(&run_id).unwrap();
    assert_eq!(run.kind, RunKind::Scheduled);
    assert_eq!(run.origin, format!("scheduler:{}", schedule.schedule_id));

    // Second tick with nothing due: no new run.
    ab_gateway::runtime::scheduler::tick(&state).await;
    let still = state.schedules.get(&schedule.schedule_id).await.unwrap();
    assert_eq!(still.last_run_id, Some(run_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn delegation_depth_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), vec![]);

    // A context already at the cap cannot delegate further.
    let ctx = ToolContext {
        run_id: "run_parent".into(),
        origin_channel: None,
        depth: state.config.workers.max_depth,
    };
    let err = workers::delegate(&state, &ctx, "dev", "go deeper", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_envelope_returns_to_parent() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![ScriptedProvider::immediate(vec![
            StreamEvent::Token { text: "research summary".into() },
            ScriptedProvider::done_event(),
        ])],
    );

    let ctx = ToolContext {
        run_id: "run_parent".into(),
        origin_channel: None,
        depth: 0,
    };
    let result = workers::delegate(&state, &ctx, "briefing", "summarize the news", true)
        .await
        .unwrap();
    assert_eq!(result["state"], "done");
    assert_eq!(result["summary"], "research summary");

    // Retained for workers.list.
    let listed = workers::list_workers(&state);
    assert!(listed
        .iter()
        .any(|w| w["worker_id"] == result["worker_id"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_expiry_resolves_deny() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        dir.path(),
        vec![
            ScriptedProvider::immediate(vec![
                StreamEvent::ToolCallFinished {
                    call_id: "call_1".into(),
                    tool_name: "shell_run".into(),
                    arguments: serde_json::json!({"command": "echo hi"}),
                },
                ScriptedProvider::done_event(),
            ]),
            ScriptedProvider::immediate(vec![
                StreamEvent::Token { text: "after denial".into() },
                ScriptedProvider::done_event(),
            ]),
        ],
    );

    let (run_id, _) = state
        .sessions
        .admit(&state, interactive_run("ws:a", "run echo hi"))
        .unwrap();
    wait_for(|| state.broker.pending_count() > 0, "permission request").await;

    // Expire everything immediately: resolves as deny, run continues.
    let expired = state.broker.expire_older_than(Duration::ZERO);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].decision, PermissionDecision::Deny);

    wait_for(|| terminal_state(&state, &run_id).is_some(), "run.final").await;
    assert_eq!(terminal_state(&state, &run_id), Some(RunState::Done));
}
