use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools (shell / filesystem / web)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Filesystem tools refuse paths outside this root. `None` = no fence.
    #[serde(default)]
    pub allowed_fs_root: Option<PathBuf>,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Per-invocation hard timeout (seconds). The child is killed on expiry.
    #[serde(default = "d_60")]
    pub timeout_s: u64,
    /// Max combined stdout+stderr chars returned to the model.
    #[serde(default = "d_200000")]
    pub max_output_chars: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_s: 60,
            max_output_chars: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "d_30")]
    pub timeout_s: u64,
    /// Max response body bytes kept.
    #[serde(default = "d_2000000")]
    pub max_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            max_bytes: 2_000_000,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_60() -> u64 {
    60
}
fn d_30() -> u64 {
    30
}
fn d_200000() -> usize {
    200_000
}
fn d_2000000() -> usize {
    2_000_000
}
