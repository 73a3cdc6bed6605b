use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontend adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Environment variable holding the bot token.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Sleep between empty long-poll rounds (seconds).
    #[serde(default = "d_poll")]
    pub poll_interval_s: u64,
    /// Minimum gap between message edits while streaming (milliseconds).
    /// Keeps us under the Bot API edit rate limit.
    #[serde(default = "d_edit_ms")]
    pub edit_interval_ms: u64,
    #[serde(default = "d_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_env: d_token_env(),
            poll_interval_s: d_poll(),
            edit_interval_ms: d_edit_ms(),
            api_base: d_api_base(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".into()
}
fn d_poll() -> u64 {
    1
}
fn d_edit_ms() -> u64 {
    1200
}
fn d_api_base() -> String {
    "https://api.telegram.org".into()
}
