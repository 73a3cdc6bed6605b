use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-log rotation settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rotation/pruning knobs keyed by log kind (`events`, `memory_events`).
/// Unlisted kinds fall back to the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(flatten)]
    pub kinds: HashMap<String, LogRotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRotation {
    #[serde(default = "d_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "d_keep_days")]
    pub keep_days: u64,
    #[serde(default = "d_keep_max_files")]
    pub keep_max_files: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_bytes: d_max_bytes(),
            keep_days: d_keep_days(),
            keep_max_files: d_keep_max_files(),
        }
    }
}

impl LogsConfig {
    /// Settings for a log kind, falling back to defaults.
    pub fn rotation(&self, kind: &str) -> LogRotation {
        self.kinds.get(kind).cloned().unwrap_or_default()
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_bytes() -> u64 {
    10_000_000
}
fn d_keep_days() -> u64 {
    30
}
fn d_keep_max_files() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_uses_defaults() {
        let cfg = LogsConfig::default();
        let r = cfg.rotation("events");
        assert_eq!(r.max_bytes, 10_000_000);
        assert_eq!(r.keep_max_files, 50);
    }

    #[test]
    fn per_kind_override() {
        let raw = r#"
            [memory_events]
            max_bytes = 5000000
            keep_days = 7
        "#;
        let cfg: LogsConfig = toml::from_str(raw).unwrap();
        let r = cfg.rotation("memory_events");
        assert_eq!(r.max_bytes, 5_000_000);
        assert_eq!(r.keep_days, 7);
        assert_eq!(r.keep_max_files, 50);
        assert_eq!(cfg.rotation("events").max_bytes, 10_000_000);
    }
}
