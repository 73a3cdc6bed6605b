use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Maximum delegation depth. A run at depth max_depth receives `denied`
    /// when it tries to delegate further.
    #[serde(default = "d_depth")]
    pub max_depth: u32,
    /// Terminated workers retained for `workers.list`.
    #[serde(default = "d_retained")]
    pub max_retained: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_depth: d_depth(),
            max_retained: d_retained(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_depth() -> u32 {
    2
}
fn d_retained() -> usize {
    50
}
