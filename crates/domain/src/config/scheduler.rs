use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default IANA timezone for schedules that don't carry their own.
    #[serde(default = "d_tz")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { timezone: d_tz() }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_tz() -> String {
    "UTC".into()
}
