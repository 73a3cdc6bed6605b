use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills (markdown documents injected into the system prompt)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_dirs")]
    pub dirs: Vec<PathBuf>,
    /// Skill names (file stems) to load. Empty = none.
    #[serde(default = "d_enabled")]
    pub enabled: Vec<String>,
    /// Total character budget across all loaded skills.
    #[serde(default = "d_max_chars")]
    pub max_chars: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dirs: d_dirs(),
            enabled: d_enabled(),
            max_chars: d_max_chars(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("./skills")]
}
fn d_enabled() -> Vec<String> {
    vec!["general".into()]
}
fn d_max_chars() -> usize {
    12_000
}
