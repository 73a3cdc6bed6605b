//! LLM-driven durable-fact extraction for one completed turn.
//!
//! The extractor is intentionally strict to reduce low-value memory churn:
//! candidates below the importance floor never reach the store.

use ab_domain::error::Result;
use ab_domain::tool::Message;
use ab_providers::{chat_json, LlmProvider};

use crate::types::ExtractedMemory;

pub struct MemoryExtractor {
    model: String,
    /// Floor on the model's 1-10 importance scale.
    importance_min: u8,
}

impl MemoryExtractor {
    pub fn new(model: impl Into<String>, importance_min: u8) -> Self {
        Self {
            model: model.into(),
            importance_min,
        }
    }

    fn system_prompt(&self) -> &'static str {
        "You extract durable long-term memory for a personal AI assistant.\n\
         Only extract items that will still matter later.\n\
         Prefer: facts, preferences, decisions, project constraints, commitments, recurring routines.\n\
         Avoid: greetings, temporary chatter, and one-off execution noise.\n\
         Return JSON only with this schema:\n\
         { \"memories\": [ { \"type\": \"fact|preference|decision|project|routine|constraint\", \
         \"content\": \"string\", \"context\": \"string\", \"importance\": 1, \"tags\": [\"string\"] } ] }\n\
         importance must be 1-10."
    }

    fn user_prompt(user_text: &str, assistant_text: &str) -> String {
        format!(
            "Extract durable memories from this exchange.\n\nUSER:\n{user_text}\n\nASSISTANT:\n{assistant_text}\n"
        )
    }

    /// Extract candidates from one exchange. Short exchanges are skipped
    /// without an LLM call.
    pub async fn extract(
        &self,
        provider: &dyn LlmProvider,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<Vec<ExtractedMemory>> {
        if user_text.trim().len() < 8 || assistant_text.trim().len() < 8 {
            return Ok(Vec::new());
        }

        let data = chat_json(
            provider,
            &self.model,
            vec![
                Message::system(self.system_prompt()),
                Message::user(Self::user_prompt(user_text, assistant_text)),
            ],
        )
        .await?;

        Ok(self.parse_candidates(&data))
    }

    fn parse_candidates(&self, data: &serde_json::Value) -> Vec<ExtractedMemory> {
        let raw = match data.get("memories").and_then(|v| v.as_array()) {
            Some(arr) => arr,
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for item in raw {
            let kind = item
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            let text = item
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if kind.is_empty() || text.is_empty() {
                continue;
            }
            let importance_raw = item
                .get("importance")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                .min(10) as u8;
            if importance_raw < self.importance_min {
                continue;
            }
            let tags = item
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|t| t.as_str())
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            out.push(ExtractedMemory {
                kind,
                text,
                context: item
                    .get("context")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string(),
                importance: f32::from(importance_raw) / 10.0,
                tags,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_filters_below_importance_floor() {
        let ex = MemoryExtractor::new("m", 6);
        let data = json!({
            "memories": [
                {"type": "fact", "content": "keeper", "importance": 8, "tags": ["a"]},
                {"type": "fact", "content": "noise", "importance": 3},
            ]
        });
        let out = ex.parse_candidates(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "keeper");
        assert!((out[0].importance - 0.8).abs() < 1e-6);
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let ex = MemoryExtractor::new("m", 1);
        let data = json!({
            "memories": [
                {"type": "", "content": "no kind", "importance": 9},
                {"type": "fact", "content": "", "importance": 9},
                {"type": "fact", "content": "ok", "importance": 9, "tags": ["", " x "]},
                "not an object",
            ]
        });
        let out = ex.parse_candidates(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tags, vec!["x".to_string()]);
    }

    #[test]
    fn parse_handles_missing_memories_key() {
        let ex = MemoryExtractor::new("m", 6);
        assert!(ex.parse_candidates(&json!({})).is_empty());
        assert!(ex.parse_candidates(&json!({"memories": "oops"})).is_empty());
    }

    #[test]
    fn importance_is_clamped_to_scale() {
        let ex = MemoryExtractor::new("m", 1);
        let data = json!({
            "memories": [{"type": "fact", "content": "big", "importance": 99}]
        });
        let out = ex.parse_candidates(&data);
        assert!((out[0].importance - 1.0).abs() < 1e-6);
    }
}
