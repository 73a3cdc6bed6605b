//! Tool registry — a fixed table mapping tool name to capability label,
//! input schema, and invoke function. The schemas exposed to the LLM are
//! built from this table; dispatch never leaves it.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use ab_domain::error::{Error, Result};
use ab_domain::tool::ToolDefinition;
use ab_tools::{classify_shell_capability, fs, shell, web};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call context threaded into tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub origin_channel: Option<String>,
    pub depth: u32,
}

pub type ToolInvoke =
    for<'a> fn(&'a AppState, &'a ToolContext, Value) -> BoxFuture<'a, Result<Value>>;

pub struct ToolSpec {
    pub name: &'static str,
    pub capability: &'static str,
    pub description: &'static str,
    pub parameters: fn() -> Value,
    pub invoke: ToolInvoke,
}

pub fn registry() -> &'static [ToolSpec] {
    &REGISTRY
}

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    REGISTRY.iter().find(|t| t.name == name)
}

/// Tool schemas for the LLM request.
pub fn build_tool_definitions() -> Vec<ToolDefinition> {
    REGISTRY
        .iter()
        .map(|t| ToolDefinition {
            name: t.name.to_string(),
            description: t.description.to_string(),
            parameters: (t.parameters)(),
        })
        .collect()
}

/// The effective capability for an invocation. Shell commands carrying
/// write primitives are reclassified to `shell.write` before policy
/// matching — a fixed table, never model-discretionary.
pub fn capability_for(spec: &ToolSpec, args: &Value) -> String {
    if spec.name == "shell_run" {
        let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
        return classify_shell_capability(command).to_string();
    }
    spec.capability.to_string()
}

/// Human-readable preview shown in permission prompts.
pub fn preview_for(spec: &ToolSpec, args: &Value) -> String {
    let field = match spec.name {
        "shell_run" => "command",
        "fs_read" | "fs_list" | "fs_write" => "path",
        "web_fetch" => "url",
        "memory_search" => "query",
        "memory_pin" => "text",
        "memory_delete" => "id",
        "delegate" => "task",
        _ => return args.to_string(),
    };
    args.get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| args.to_string())
}

/// Execute a tool by name. Errors come back as structured `(text, is_error)`
/// results so the model can react instead of the run dying.
pub async fn dispatch(
    state: &AppState,
    ctx: &ToolContext,
    name: &str,
    args: &Value,
) -> (String, bool) {
    let Some(spec) = find(name) else {
        return (format!("unknown tool: {name}"), true);
    };
    match (spec.invoke)(state, ctx, args.clone()).await {
        Ok(value) => {
            let text = match value {
                Value::String(s) => s,
                other => serde_json::to_string_pretty(&other).unwrap_or_default(),
            };
            (text, false)
        }
        Err(e) => (e.to_string(), true),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static REGISTRY: [ToolSpec; 9] = [
    ToolSpec {
        name: "shell_run",
        capability: "shell.run",
        description: "Run a shell command and return its output.",
        parameters: shell_params,
        invoke: invoke_shell,
    },
    ToolSpec {
        name: "fs_read",
        capability: "filesystem.read",
        description: "Read a text file.",
        parameters: path_params,
        invoke: invoke_fs_read,
    },
    ToolSpec {
        name: "fs_list",
        capability: "filesystem.list",
        description: "List a directory.",
        parameters: path_params,
        invoke: invoke_fs_list,
    },
    ToolSpec {
        name: "fs_write",
        capability: "filesystem.write",
        description: "Write a text file (overwrites).",
        parameters: write_params,
        invoke: invoke_fs_write,
    },
    ToolSpec {
        name: "web_fetch",
        capability: "web.fetch",
        description: "Fetch a URL over HTTP(S) and return the body.",
        parameters: url_params,
        invoke: invoke_web_fetch,
    },
    ToolSpec {
        name: "memory_search",
        capability: "memory.search",
        description: "Search long-term memory.",
        parameters: query_params,
        invoke: invoke_memory_search,
    },
    ToolSpec {
        name: "memory_pin",
        capability: "memory.pin",
        description: "Pin a fact into always-loaded memory.",
        parameters: text_params,
        invoke: invoke_memory_pin,
    },
    ToolSpec {
        name: "memory_delete",
        capability: "memory.delete",
        description: "Delete a long-term memory item by id. Only use when the user explicitly asks.",
        parameters: id_params,
        invoke: invoke_memory_delete,
    },
    ToolSpec {
        name: "delegate",
        capability: "workers.run",
        description: "Delegate a task to a sub-worker run and return its result envelope.",
        parameters: delegate_params,
        invoke: invoke_delegate,
    },
];

// ── Schemas ─────────────────────────────────────────────────────────

fn obj_schema(props: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": props, "required": required })
}

fn shell_params() -> Value {
    obj_schema(
        json!({"command": {"type": "string", "description": "Command passed to sh -c"}}),
        &["command"],
    )
}

fn path_params() -> Value {
    obj_schema(json!({"path": {"type": "string"}}), &["path"])
}

fn write_params() -> Value {
    obj_schema(
        json!({"path": {"type": "string"}, "content": {"type": "string"}}),
        &["path", "content"],
    )
}

fn url_params() -> Value {
    obj_schema(json!({"url": {"type": "string"}}), &["url"])
}

fn query_params() -> Value {
    obj_schema(
        json!({"query": {"type": "string"}, "limit": {"type": "integer"}}),
        &["query"],
    )
}

fn text_params() -> Value {
    obj_schema(json!({"text": {"type": "string"}}), &["text"])
}

fn id_params() -> Value {
    obj_schema(json!({"id": {"type": "string"}}), &["id"])
}

fn delegate_params() -> Value {
    obj_schema(
        json!({
            "role": {"type": "string", "description": "Worker role label, e.g. briefing | quant | dev"},
            "task": {"type": "string", "description": "The worker job instruction"},
            "wait": {"type": "boolean", "description": "Wait for the worker to finish (default true)"}
        }),
        &["role", "task"],
    )
}

// ── Argument helpers ────────────────────────────────────────────────

fn str_arg(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::Tool {
            tool: "args".into(),
            message: format!("missing required string argument: {key}"),
        })
}

// ── Invoke functions ────────────────────────────────────────────────

fn invoke_shell<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let command = str_arg(&args, "command")?;
        let outcome = shell::run(&command, &state.config.tools.shell).await;
        Ok(serde_json::to_value(outcome)?)
    })
}

fn invoke_fs_read<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = str_arg(&args, "path")?;
        let content = fs::read(&path, state.config.tools.allowed_fs_root.as_deref()).await?;
        Ok(Value::String(content))
    })
}

fn invoke_fs_list<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = str_arg(&args, "path")?;
        let entries = fs::list(&path, state.config.tools.allowed_fs_root.as_deref()).await?;
        Ok(serde_json::to_value(entries)?)
    })
}

fn invoke_fs_write<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        let written =
            fs::write(&path, &content, state.config.tools.allowed_fs_root.as_deref()).await?;
        Ok(json!({"ok": true, "bytes": written}))
    })
}

fn invoke_web_fetch<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let url = str_arg(&args, "url")?;
        let page = web::fetch(&url, &state.config.tools.web).await?;
        Ok(serde_json::to_value(page)?)
    })
}

fn invoke_memory_search<'a>(
    state: &'a AppState,
    _ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let query = str_arg(&args, "query")?;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(8) as usize;
        let provider = state.provider.as_ref().map(|p| p.as_ref() as &dyn ab_providers::LlmProvider);
        let items = state.memory.search(&query, limit, provider).await?;
        Ok(serde_json::to_value(items)?)
    })
}

fn invoke_memory_pin<'a>(
    state: &'a AppState,
    ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let text = str_arg(&args, "text")?;
        let change = state.memory.pin(&text)?;
        if let Some(change) = &change {
            crate::events::emit_memory_change(state, &ctx.run_id, change);
        }
        Ok(json!({"ok": true, "added": change.is_some()}))
    })
}

fn invoke_memory_delete<'a>(
    state: &'a AppState,
    ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let id = str_arg(&args, "id")?;
        let change = state.memory.delete(&id).await?;
        match change {
            Some(change) => {
                crate::events::emit_memory_change(state, &ctx.run_id, &change);
                Ok(json!({"ok": true, "id": id}))
            }
            None => Err(Error::Tool {
                tool: "memory_delete".into(),
                message: format!("no memory item with id {id}"),
            }),
        }
    })
}

fn invoke_delegate<'a>(
    state: &'a AppState,
    ctx: &'a ToolContext,
    args: Value,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let role = str_arg(&args, "role")?;
        let task = str_arg(&args, "task")?;
        let wait = args.get("wait").and_then(|v| v.as_bool()).unwrap_or(true);
        let outcome = crate::runtime::workers::delegate(state, ctx, &role, &task, wait).await?;
        Ok(serde_json::to_value(outcome)?)
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<&str> = registry().iter().map(|t| t.name).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn definitions_mirror_registry() {
        let defs = build_tool_definitions();
        assert_eq!(defs.len(), registry().len());
        let shell = defs.iter().find(|d| d.name == "shell_run").unwrap();
        assert_eq!(shell.parameters["required"][0], "command");
    }

    #[test]
    fn shell_capability_is_reclassified_for_writes() {
        let spec = find("shell_run").unwrap();
        assert_eq!(
            capability_for(spec, &json!({"command": "echo hi"})),
            "shell.run"
        );
        assert_eq!(
            capability_for(spec, &json!({"command": "echo hi > tmp/test.txt"})),
            "shell.write"
        );
        // Other tools keep their static label.
        let fs_spec = find("fs_write").unwrap();
        assert_eq!(
            capability_for(fs_spec, &json!({"path": "x"})),
            "filesystem.write"
        );
    }

    #[test]
    fn preview_extracts_primary_field() {
        let spec = find("shell_run").unwrap();
        assert_eq!(preview_for(spec, &json!({"command": "echo hi"})), "echo hi");
        let spec = find("web_fetch").unwrap();
        assert_eq!(
            preview_for(spec, &json!({"url": "https://example.com"})),
            "https://example.com"
        );
    }

    #[test]
    fn unknown_tool_not_found() {
        assert!(find("rm_rf_everything").is_none());
    }
}
