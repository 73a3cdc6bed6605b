//! Permission broker — matches tool invocations against the allow/ask/deny
//! policy and suspends runs awaiting a human decision.
//!
//! Decision precedence is deny > ask > allow; within a class the first
//! matching rule wins. Unknown capabilities default to ask. Pending
//! requests resolve through a oneshot each; a second response for the same
//! `perm_id` is dropped silently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;

use ab_domain::config::{PermissionRule, PermissionsConfig};
use ab_domain::error::{Error, Result};
use ab_domain::event::{new_perm_id, PermissionDecision};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    Ask,
    Deny,
}

struct CompiledRule {
    capability: String,
    args_regex: Option<regex::Regex>,
}

impl CompiledRule {
    fn compile(rule: &PermissionRule) -> Result<Self> {
        let args_regex = match rule.args_regex() {
            Some(raw) => Some(
                regex::Regex::new(raw)
                    .map_err(|e| Error::Config(format!("bad args_regex {raw:?}: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            capability: rule.capability().to_string(),
            args_regex,
        })
    }

    fn matches(&self, capability: &str, preview: &str) -> bool {
        if !glob_match(&self.capability, capability) {
            return false;
        }
        match &self.args_regex {
            Some(re) => re.is_match(preview),
            None => true,
        }
    }
}

/// `*` matches any run of characters; everything else is literal.
/// Covers the policy vocabulary (`web.*`, `shell.run`, `*`).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// An immutable compiled policy snapshot.
pub struct Policy {
    allow: Vec<CompiledRule>,
    ask: Vec<CompiledRule>,
    deny: Vec<CompiledRule>,
}

impl Policy {
    pub fn compile(cfg: &PermissionsConfig) -> Result<Self> {
        let compile_all = |rules: &[PermissionRule]| -> Result<Vec<CompiledRule>> {
            rules.iter().map(CompiledRule::compile).collect()
        };
        Ok(Self {
            allow: compile_all(&cfg.allow)?,
            ask: compile_all(&cfg.ask)?,
            deny: compile_all(&cfg.deny)?,
        })
    }

    pub fn check(&self, capability: &str, preview: &str) -> PolicyVerdict {
        if self.deny.iter().any(|r| r.matches(capability, preview)) {
            return PolicyVerdict::Deny;
        }
        if self.ask.iter().any(|r| r.matches(capability, preview)) {
            return PolicyVerdict::Ask;
        }
        if self.allow.iter().any(|r| r.matches(capability, preview)) {
            return PolicyVerdict::Allow;
        }
        PolicyVerdict::Ask
    }
}

/// Copy-on-reload holder: callers always see one consistent snapshot.
pub struct PolicyStore {
    current: RwLock<Arc<Policy>>,
    remember: bool,
}

impl PolicyStore {
    pub fn new(cfg: &PermissionsConfig) -> Result<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(Policy::compile(cfg)?)),
            remember: cfg.remember,
        })
    }

    pub fn snapshot(&self) -> Arc<Policy> {
        self.current.read().clone()
    }

    pub fn check(&self, capability: &str, preview: &str) -> PolicyVerdict {
        self.snapshot().check(capability, preview)
    }

    /// Persist a remembered decision into the config document (exact
    /// capability, no pattern synthesis) and swap in a fresh snapshot.
    /// No-op unless `permissions.remember` is enabled.
    pub fn persist_decision(
        &self,
        config_path: &Path,
        capability: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        if !self.remember || capability.is_empty() {
            return Ok(());
        }

        let raw = std::fs::read_to_string(config_path).unwrap_or_default();
        let mut doc: toml::Value = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("reading {}: {e}", config_path.display())))?;

        let root = doc
            .as_table_mut()
            .ok_or_else(|| Error::Config("config root is not a table".into()))?;
        let perms = root
            .entry("permissions")
            .or_insert_with(|| toml::Value::Table(Default::default()))
            .as_table_mut()
            .ok_or_else(|| Error::Config("permissions is not a table".into()))?;

        for list in ["allow", "ask", "deny"] {
            if let Some(arr) = perms.get_mut(list).and_then(|v| v.as_array_mut()) {
                arr.retain(|v| v.as_str() != Some(capability));
            }
        }
        let target = match decision {
            PermissionDecision::Allow => "allow",
            PermissionDecision::Deny => "deny",
        };
        perms
            .entry(target)
            .or_insert_with(|| toml::Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| Error::Config(format!("permissions.{target} is not an array")))?
            .push(toml::Value::String(capability.to_string()));

        let serialized = toml::to_string_pretty(&doc)
            .map_err(|e| Error::Config(format!("serializing config: {e}")))?;
        std::fs::write(config_path, serialized)?;

        // Reload the snapshot from the updated document.
        let cfg: ab_domain::config::Config = {
            let raw = std::fs::read_to_string(config_path)?;
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
        };
        *self.current.write() = Arc::new(Policy::compile(&cfg.permissions)?);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending permission requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializable view of a pending request (re-emitted on reconnect).
#[derive(Debug, Clone, Serialize)]
pub struct PendingInfo {
    pub perm_id: String,
    pub run_id: String,
    pub capability: String,
    pub tool_name: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

struct PendingPermission {
    info: PendingInfo,
    /// Channel the request was emitted on; `None` for scheduler runs with
    /// no connected origin.
    channel: Option<String>,
    responder: oneshot::Sender<PermissionDecision>,
}

/// The decision plus routing context, handed back to whoever resolved it.
#[derive(Debug, Clone)]
pub struct ResolvedPermission {
    pub perm_id: String,
    pub run_id: String,
    pub decision: PermissionDecision,
}

#[derive(Default)]
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, PendingPermission>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending request. The executor awaits the returned receiver;
    /// it resolves on `respond`, stop, or expiry.
    pub fn request(
        &self,
        run_id: &str,
        channel: Option<String>,
        capability: &str,
        tool_name: &str,
        preview: &str,
    ) -> (PendingInfo, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        let info = PendingInfo {
            perm_id: new_perm_id(),
            run_id: run_id.to_string(),
            capability: capability.to_string(),
            tool_name: tool_name.to_string(),
            preview: preview.to_string(),
            created_at: Utc::now(),
        };
        self.pending.lock().insert(
            info.perm_id.clone(),
            PendingPermission {
                info: info.clone(),
                channel,
                responder: tx,
            },
        );
        (info, rx)
    }

    /// Resolve a pending request. Idempotent: an unknown or already-resolved
    /// `perm_id` returns `None` and nothing else happens.
    pub fn respond(&self, perm_id: &str, decision: PermissionDecision) -> Option<ResolvedPermission> {
        let pending = self.pending.lock().remove(perm_id)?;
        let run_id = pending.info.run_id.clone();
        let _ = pending.responder.send(decision);
        Some(ResolvedPermission {
            perm_id: perm_id.to_string(),
            run_id,
            decision,
        })
    }

    /// Deny every open request of a run (stop path). Returns the resolutions.
    pub fn deny_all_for_run(&self, run_id: &str) -> Vec<ResolvedPermission> {
        let ids: Vec<String> = {
            let pending = self.pending.lock();
            pending
                .values()
                .filter(|p| p.info.run_id == run_id)
                .map(|p| p.info.perm_id.clone())
                .collect()
        };
        ids.iter()
            .filter_map(|id| self.respond(id, PermissionDecision::Deny))
            .collect()
    }

    /// Requests still pending for a channel — including channel-less ones
    /// from scheduled runs, which any connecting client may answer.
    pub fn pending_for_channel(&self, channel: &str) -> Vec<PendingInfo> {
        self.pending
            .lock()
            .values()
            .filter(|p| p.channel.as_deref() == Some(channel) || p.channel.is_none())
            .map(|p| p.info.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve everything older than `max_age` as deny. Returns the expired
    /// resolutions so the caller can log `permission.response` events.
    pub fn expire_older_than(&self, max_age: std::time::Duration) -> Vec<ResolvedPermission> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let expired: Vec<String> = {
            let pending = self.pending.lock();
            pending
                .values()
                .filter(|p| p.info.created_at < cutoff)
                .map(|p| p.info.perm_id.clone())
                .collect()
        };
        expired
            .iter()
            .filter_map(|id| self.respond(id, PermissionDecision::Deny))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_from_toml(raw: &str) -> Policy {
        let cfg: PermissionsConfig = toml::from_str(raw).unwrap();
        Policy::compile(&cfg).unwrap()
    }

    #[test]
    fn glob_match_basics() {
        assert!(glob_match("shell.run", "shell.run"));
        assert!(glob_match("web.*", "web.fetch"));
        assert!(glob_match("*", "anything.at.all"));
        assert!(!glob_match("web.*", "shell.run"));
        assert!(!glob_match("shell.run", "shell.write"));
    }

    #[test]
    fn precedence_deny_over_ask_over_allow() {
        let policy = policy_from_toml(
            r#"
            allow = ["shell.*"]
            ask = ["shell.write"]
            deny = ["shell.write"]
            "#,
        );
        assert_eq!(policy.check("shell.write", ""), PolicyVerdict::Deny);
        assert_eq!(policy.check("shell.run", ""), PolicyVerdict::Allow);
    }

    #[test]
    fn unknown_capability_defaults_to_ask() {
        let policy = policy_from_toml("allow = []\nask = []\ndeny = []");
        assert_eq!(policy.check("novel.capability", ""), PolicyVerdict::Ask);
    }

    #[test]
    fn args_regex_narrows_a_rule() {
        let policy = policy_from_toml(
            r#"
            allow = [{ capability = "shell.run", args_regex = "^git " }]
            "#,
        );
        assert_eq!(policy.check("shell.run", "git status"), PolicyVerdict::Allow);
        // Non-matching preview falls through to the ask default.
        assert_eq!(policy.check("shell.run", "rm -rf /"), PolicyVerdict::Ask);
    }

    #[test]
    fn default_policy_asks_for_shell_write() {
        let policy = Policy::compile(&PermissionsConfig::default()).unwrap();
        assert_eq!(policy.check("shell.write", "echo hi > f"), PolicyVerdict::Ask);
        assert_eq!(policy.check("filesystem.read", "/tmp/x"), PolicyVerdict::Allow);
    }

    #[tokio::test]
    async fn respond_resolves_waiter_once() {
        let broker = PermissionBroker::new();
        let (info, rx) = broker.request("run_1", Some("ws:cli".into()), "shell.run", "shell_run", "echo hi");

        let first = broker.respond(&info.perm_id, PermissionDecision::Allow);
        assert!(first.is_some());
        assert_eq!(rx.await.unwrap(), PermissionDecision::Allow);

        // Second response with the same perm_id is a silent no-op.
        let second = broker.respond(&info.perm_id, PermissionDecision::Deny);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn deny_all_for_run_resolves_open_requests() {
        let broker = PermissionBroker::new();
        let (_i1, rx1) = broker.request("run_1", None, "shell.run", "shell_run", "a");
        let (_i2, rx2) = broker.request("run_2", None, "shell.run", "shell_run", "b");

        let resolved = broker.deny_all_for_run("run_1");
        assert_eq!(resolved.len(), 1);
        assert_eq!(rx1.await.unwrap(), PermissionDecision::Deny);
        // run_2's request is untouched.
        assert_eq!(broker.pending_count(), 1);
        drop(rx2);
    }

    #[test]
    fn pending_for_channel_includes_channelless() {
        let broker = PermissionBroker::new();
        let (_a, _rxa) = broker.request("run_a", Some("ws:cli".into()), "c", "t", "p");
        let (_b, _rxb) = broker.request("run_b", Some("telegram:9".into()), "c", "t", "p");
        let (_c, _rxc) = broker.request("run_c", None, "c", "t", "p");

        let for_cli = broker.pending_for_channel("ws:cli");
        let runs: Vec<&str> = for_cli.iter().map(|p| p.run_id.as_str()).collect();
        assert!(runs.contains(&"run_a"));
        assert!(runs.contains(&"run_c"));
        assert!(!runs.contains(&"run_b"));
    }

    #[tokio::test]
    async fn expiry_resolves_as_deny() {
        let broker = PermissionBroker::new();
        let (_info, rx) = broker.request("run_1", None, "c", "t", "p");
        let expired = broker.expire_older_than(std::time::Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].decision, PermissionDecision::Deny);
        assert_eq!(rx.await.unwrap(), PermissionDecision::Deny);
    }

    #[test]
    fn persist_decision_rewrites_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_blob.toml");
        std::fs::write(&path, "[permissions]\nremember = true\nask = [\"web.fetch\"]\n").unwrap();

        let cfg: ab_domain::config::Config =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let store = PolicyStore::new(&cfg.permissions).unwrap();
        assert_eq!(store.check("web.fetch", ""), PolicyVerdict::Ask);

        store
            .persist_decision(&path, "web.fetch", PermissionDecision::Allow)
            .unwrap();

        // Snapshot reloaded: web.fetch is now allow.
        assert_eq!(store.check("web.fetch", ""), PolicyVerdict::Allow);
        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: toml::Value = toml::from_str(&raw).unwrap();
        let allow = doc["permissions"]["allow"].as_array().unwrap();
        assert!(allow.iter().any(|v| v.as_str() == Some("web.fetch")));
    }
}
