use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task snapshot retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Non-terminal tasks idle longer than this are auto-closed.
    /// Runs in waiting_permission are exempt.
    #[serde(default = "d_auto_close")]
    pub auto_close_after_s: u64,
    /// Terminal tasks are kept at most this many days.
    #[serde(default = "d_keep_days")]
    pub keep_done_days: u64,
    /// And at most this many entries.
    #[serde(default = "d_keep_max")]
    pub keep_done_max: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            auto_close_after_s: d_auto_close(),
            keep_done_days: d_keep_days(),
            keep_done_max: d_keep_max(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_auto_close() -> u64 {
    21_600
}
fn d_keep_days() -> u64 {
    30
}
fn d_keep_max() -> usize {
    200
}
