use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Long-term memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "d_dir")]
    pub dir: PathBuf,
    /// Extracted candidates below this importance (1-10) are dropped.
    #[serde(default = "d_importance_min")]
    pub importance_min: u8,
    /// Cosine similarity above which two items are merged as near-duplicates.
    #[serde(default = "d_similarity")]
    pub dedup_similarity: f32,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: d_dir(),
            importance_min: d_importance_min(),
            dedup_similarity: d_similarity(),
            retrieval: RetrievalConfig::default(),
            embeddings: EmbeddingsConfig::default(),
        }
    }
}

/// Bounds on each section of the memory packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Last R turn pairs for the requesting origin.
    #[serde(default = "d_recent_turns")]
    pub recent_turns_limit: usize,
    /// Related turns pulled in by similarity.
    #[serde(default = "d_related_turns")]
    pub related_turns_limit: usize,
    /// Top-K long-term items.
    #[serde(default = "d_structured")]
    pub structured_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recent_turns_limit: d_recent_turns(),
            related_turns_limit: d_related_turns(),
            structured_limit: d_structured(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_embedding_model")]
    pub model: String,
    /// Items embedded per supervisor maintenance pass.
    #[serde(default = "d_batch")]
    pub batch_size: usize,
    /// Most recent embedded items scanned per vector query.
    #[serde(default = "d_scan")]
    pub vector_scan_limit: usize,
    /// Vector candidates kept before union reranking.
    #[serde(default = "d_top_k")]
    pub vector_top_k: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: d_embedding_model(),
            batch_size: d_batch(),
            vector_scan_limit: d_scan(),
            vector_top_k: d_top_k(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_dir() -> PathBuf {
    PathBuf::from("./memory")
}
fn d_importance_min() -> u8 {
    6
}
fn d_similarity() -> f32 {
    0.92
}
fn d_recent_turns() -> usize {
    6
}
fn d_related_turns() -> usize {
    4
}
fn d_structured() -> usize {
    8
}
fn d_true() -> bool {
    true
}
fn d_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn d_batch() -> usize {
    16
}
fn d_scan() -> usize {
    2000
}
fn d_top_k() -> usize {
    50
}
