use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session queues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Soft cap on queued (not yet running) requests per session; beyond it
    /// new `agent` requests are rejected with queue_full.
    #[serde(default = "d_cap")]
    pub queue_soft_cap: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { queue_soft_cap: d_cap() }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_cap() -> usize {
    8
}
