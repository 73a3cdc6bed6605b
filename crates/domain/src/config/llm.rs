use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key. Never the key itself.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model_name: String,
    /// Model used for memory extraction. Falls back to `model_name`.
    #[serde(default)]
    pub extraction_model: Option<String>,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Overall per-turn stream timeout (seconds).
    #[serde(default = "d_turn_timeout")]
    pub turn_timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            model_name: d_model(),
            extraction_model: None,
            temperature: d_temperature(),
            turn_timeout_s: d_turn_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn extraction_model(&self) -> &str {
        self.extraction_model.as_deref().unwrap_or(&self.model_name)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_temperature() -> f32 {
    0.2
}
fn d_turn_timeout() -> u64 {
    600
}
