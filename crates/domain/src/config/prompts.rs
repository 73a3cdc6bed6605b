use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "d_true")]
    pub include_identity: bool,
    #[serde(default = "d_true")]
    pub include_memory: bool,
    #[serde(default = "d_true")]
    pub include_skills: bool,
    /// Appended verbatim after the built-in sections.
    #[serde(default)]
    pub extra_instructions: Option<String>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            include_identity: true,
            include_memory: true,
            include_skills: true,
            extra_instructions: None,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
