//! Long-term memory service: pinned items, a SQLite-backed consolidated
//! item store with hybrid (BM25 + vector + recency) retrieval, a per-origin
//! turn archive, LLM-driven fact extraction, and lazy embedding maintenance.

mod audit;
mod db;
mod extractor;
mod pinned;
mod service;
mod types;

pub use audit::{prune_archives, rotate_jsonl, AuditLog};
pub use db::{fingerprint, normalize_text, MemoryDb};
pub use extractor::MemoryExtractor;
pub use pinned::{PinnedItem, PinnedStore};
pub use service::MemoryService;
pub use types::{ExtractedMemory, MemoryChange, MemoryItem, MemoryPacket, TurnPair};
