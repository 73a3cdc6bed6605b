use serde::{Deserialize, Serialize};

/// One consolidated long-term memory item. `item_id` is the dedup
/// fingerprint (hash of kind + normalized text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub item_id: String,
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub context: String,
    /// Normalized to [0, 1].
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at_ms: i64,
    pub last_seen_at_ms: i64,
    /// How many times this item has been re-extracted.
    pub count: u32,
}

/// One user/assistant exchange archived for packet building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnPair {
    pub origin: String,
    pub user_text: String,
    pub assistant_text: String,
    pub created_at_ms: i64,
}

/// The bounded context injected into a model turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryPacket {
    pub pinned: Vec<crate::pinned::PinnedItem>,
    /// Last R exchanges for the requesting origin, oldest first.
    pub recent_turns: Vec<TurnPair>,
    /// Similar exchanges from other points in history.
    pub related_turns: Vec<TurnPair>,
    /// Top-K long-term items by hybrid score.
    pub items: Vec<MemoryItem>,
}

impl MemoryPacket {
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
            && self.recent_turns.is_empty()
            && self.related_turns.is_empty()
            && self.items.is_empty()
    }
}

/// A candidate produced by the extractor, before consolidation.
#[derive(Debug, Clone)]
pub struct ExtractedMemory {
    pub kind: String,
    pub text: String,
    pub context: String,
    /// Normalized to [0, 1].
    pub importance: f32,
    pub tags: Vec<String>,
}

/// What a store mutation did — the gateway turns these into
/// `memory.added` / `memory.modified` / `memory.removed` events.
#[derive(Debug, Clone)]
pub enum MemoryChange {
    Added { item_id: String, text: String },
    Modified { item_id: String },
    Removed { item_id: String },
}
