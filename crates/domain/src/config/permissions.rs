use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered rule lists. Decision precedence is deny > ask > allow; within a
/// class the first matching rule wins. Unknown capabilities default to ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "d_allow")]
    pub allow: Vec<PermissionRule>,
    #[serde(default = "d_ask")]
    pub ask: Vec<PermissionRule>,
    #[serde(default)]
    pub deny: Vec<PermissionRule>,
    /// Persist `remember: true` decisions back into the policy document.
    #[serde(default)]
    pub remember: bool,
    /// Pending requests older than this resolve as deny.
    #[serde(default = "d_max_age_s")]
    pub max_age_s: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allow: d_allow(),
            ask: d_ask(),
            deny: Vec::new(),
            remember: false,
            max_age_s: d_max_age_s(),
        }
    }
}

/// One rule: a capability pattern (`shell.run`, `web.*`) with an optional
/// regex predicate applied to the rendered argument preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionRule {
    Capability(String),
    Detailed {
        capability: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args_regex: Option<String>,
    },
}

impl PermissionRule {
    pub fn capability(&self) -> &str {
        match self {
            Self::Capability(c) => c,
            Self::Detailed { capability, .. } => capability,
        }
    }

    pub fn args_regex(&self) -> Option<&str> {
        match self {
            Self::Capability(_) => None,
            Self::Detailed { args_regex, .. } => args_regex.as_deref(),
        }
    }
}

impl From<&str> for PermissionRule {
    fn from(s: &str) -> Self {
        Self::Capability(s.to_string())
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_allow() -> Vec<PermissionRule> {
    vec!["filesystem.read".into(), "filesystem.list".into(), "memory.search".into()]
}
fn d_ask() -> Vec<PermissionRule> {
    vec![
        "shell.run".into(),
        "shell.write".into(),
        "filesystem.write".into(),
        "memory.delete".into(),
        "web.*".into(),
    ]
}
fn d_max_age_s() -> u64 {
    900
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_forms_deserialize() {
        let raw = r#"
            allow = ["filesystem.read", { capability = "shell.run", args_regex = "^git " }]
        "#;
        #[derive(Deserialize)]
        struct Wrap {
            allow: Vec<PermissionRule>,
        }
        let w: Wrap = toml::from_str(raw).unwrap();
        assert_eq!(w.allow[0].capability(), "filesystem.read");
        assert_eq!(w.allow[0].args_regex(), None);
        assert_eq!(w.allow[1].capability(), "shell.run");
        assert_eq!(w.allow[1].args_regex(), Some("^git "));
    }

    #[test]
    fn defaults_gate_writes_behind_ask() {
        let cfg = PermissionsConfig::default();
        assert!(cfg.ask.iter().any(|r| r.capability() == "shell.write"));
        assert!(cfg.ask.iter().any(|r| r.capability() == "memory.delete"));
        assert!(cfg.deny.is_empty());
    }
}
