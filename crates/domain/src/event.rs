//! Canonical event model — the single record type appended to the event log
//! for every lifecycle transition and data emission of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingPermission,
    Stopping,
    Done,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Interactive,
    Scheduled,
    Worker,
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One variant per canonical event type. Serialized with a dotted `event`
/// tag so log lines and wire frames share the same vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "run.input")]
    RunInput { input: String },

    #[serde(rename = "run.status")]
    RunStatus { status: RunState },

    #[serde(rename = "run.queued")]
    RunQueued { position: usize },

    #[serde(rename = "token")]
    Token { text: String },

    #[serde(rename = "tool.call")]
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool.result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "permission.request")]
    PermissionRequest {
        perm_id: String,
        capability: String,
        tool_name: String,
        preview: String,
    },

    #[serde(rename = "permission.response")]
    PermissionResponse {
        perm_id: String,
        decision: PermissionDecision,
    },

    /// The single terminal event of every run.
    #[serde(rename = "run.final")]
    RunFinal {
        state: RunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Classification tag for failures (see `Error::kind`).
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// Free-form operational line (supervisor ticks, command replies).
    #[serde(rename = "run.log")]
    RunLog { message: String },

    #[serde(rename = "memory.added")]
    MemoryAdded { item_id: String, text: String },

    #[serde(rename = "memory.modified")]
    MemoryModified { item_id: String },

    #[serde(rename = "memory.removed")]
    MemoryRemoved { item_id: String },
}

impl EventKind {
    /// The dotted wire name of this event (matches the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunInput { .. } => "run.input",
            Self::RunStatus { .. } => "run.status",
            Self::RunQueued { .. } => "run.queued",
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool.call",
            Self::ToolResult { .. } => "tool.result",
            Self::PermissionRequest { .. } => "permission.request",
            Self::PermissionResponse { .. } => "permission.response",
            Self::RunFinal { .. } => "run.final",
            Self::RunLog { .. } => "run.log",
            Self::MemoryAdded { .. } => "memory.added",
            Self::MemoryModified { .. } => "memory.modified",
            Self::MemoryRemoved { .. } => "memory.removed",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One appended log record. `seq` is globally monotonic across segment
/// rotations; ordering within a run is total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(flatten)]
    pub event: EventKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Id helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn short_hex(prefix: &str, len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..len])
}

pub fn new_run_id() -> String {
    short_hex("run", 12)
}

pub fn new_perm_id() -> String {
    short_hex("perm", 12)
}

pub fn new_schedule_id() -> String {
    short_hex("sched", 10)
}

pub fn new_call_id() -> String {
    short_hex("call", 10)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
