use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Scheduler/health tick interval.
    #[serde(default = "d_interval")]
    pub interval_s: u64,
    /// Maintenance pass interval (pruning, rotation, embedding batches).
    #[serde(default = "d_maintenance")]
    pub maintenance_interval_s: u64,
    /// Emit a run.log line on every tick, not only on change.
    #[serde(default)]
    pub debug: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_s: d_interval(),
            maintenance_interval_s: d_maintenance(),
            debug: false,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_interval() -> u64 {
    1
}
fn d_maintenance() -> u64 {
    60
}
