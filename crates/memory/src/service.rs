//! The memory service facade: packet building, post-run ingestion,
//! search, deletion, and pinning.
//!
//! Writes are serialized behind one async mutex over the SQLite handle;
//! retrieval never waits on embedding work — items without embeddings
//! simply participate in BM25 recall only.

use std::path::Path;

use chrono::Utc;
use tokio::sync::Mutex;

use ab_domain::config::{LogRotation, MemoryConfig};
use ab_domain::error::Result;
use ab_providers::{EmbeddingsRequest, LlmProvider};

use crate::audit::AuditLog;
use crate::db::{MemoryDb, UpsertOutcome};
use crate::extractor::MemoryExtractor;
use crate::pinned::PinnedStore;
use crate::types::{MemoryChange, MemoryItem, MemoryPacket, TurnPair};

/// Near-duplicate neighbours checked per candidate.
const NEAR_TOP_M: usize = 5;

pub struct MemoryService {
    cfg: MemoryConfig,
    db: Mutex<MemoryDb>,
    pinned: PinnedStore,
    audit: AuditLog,
    extractor: MemoryExtractor,
}

impl MemoryService {
    pub fn open(cfg: MemoryConfig, extraction_model: &str) -> Result<Self> {
        let dir: &Path = &cfg.dir;
        std::fs::create_dir_all(dir)?;
        let db = MemoryDb::open(&dir.join("agent_blob.sqlite"))?;
        let pinned = PinnedStore::load(&dir.join("pinned.json"))?;
        let audit = AuditLog::new(dir, "memory_events")?;
        // importance_min is on the extractor's 1-10 scale.
        let extractor = MemoryExtractor::new(extraction_model, cfg.importance_min);
        Ok(Self {
            cfg,
            db: Mutex::new(db),
            pinned,
            audit,
            extractor,
        })
    }

    #[cfg(test)]
    pub fn open_in_dir(dir: &Path) -> Self {
        let cfg = MemoryConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        Self::open(cfg, "test-model").expect("open memory service")
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Packet building
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Assemble the bounded context for a model turn: pinned items, the
    /// last R exchanges for this origin, related exchanges by similarity,
    /// and the top-K long-term items for the run input.
    pub async fn build_packet(
        &self,
        origin: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
    ) -> Result<MemoryPacket> {
        let r = &self.cfg.retrieval;
        let db = self.db.lock().await;
        let recent_turns = db.recent_turns(origin, r.recent_turns_limit)?;
        let related_turns = db.related_turns(query, origin, r.related_turns_limit)?;
        let items = self.hybrid_search(&db, query, query_embedding, r.structured_limit)?;
        Ok(MemoryPacket {
            pinned: self.pinned.list(),
            recent_turns,
            related_turns,
            items,
        })
    }

    fn hybrid_search(
        &self,
        db: &MemoryDb,
        query: &str,
        query_embedding: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let e = &self.cfg.embeddings;
        let bm = db.search_bm25(query, e.vector_top_k.max(limit))?;
        let vec = match query_embedding {
            Some(emb) if e.enabled => {
                db.vector_candidates(emb, e.vector_scan_limit, e.vector_top_k)?
            }
            _ => Vec::new(),
        };
        db.hybrid_rank(&bm, &vec, limit, Utc::now().timestamp_millis())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Ingestion (after run completion)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Archive the turn and consolidate extracted facts into the store.
    /// Re-ingesting the same exchange deduplicates by fingerprint, so the
    /// second call only bumps `last_seen`.
    pub async fn ingest(
        &self,
        run_id: &str,
        origin: &str,
        user_text: &str,
        assistant_text: &str,
        provider: Option<&dyn LlmProvider>,
    ) -> Result<Vec<MemoryChange>> {
        {
            let db = self.db.lock().await;
            db.insert_turn(&TurnPair {
                origin: origin.to_string(),
                user_text: user_text.to_string(),
                assistant_text: assistant_text.to_string(),
                created_at_ms: Utc::now().timestamp_millis(),
            })?;
        }

        let Some(provider) = provider else {
            return Ok(Vec::new());
        };

        let candidates = self
            .extractor
            .extract(provider, user_text, assistant_text)
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Embed candidates up front so the near-duplicate check can run.
        // Failure here is non-fatal: items insert unembedded and the
        // maintenance loop picks them up later.
        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; candidates.len()];
        if self.cfg.embeddings.enabled {
            let req = EmbeddingsRequest {
                input: candidates.iter().map(|c| c.text.clone()).collect(),
                model: Some(self.cfg.embeddings.model.clone()),
            };
            match provider.embeddings(req).await {
                Ok(resp) if resp.embeddings.len() == candidates.len() => {
                    embeddings = resp.embeddings.into_iter().map(Some).collect();
                }
                Ok(_) => {
                    tracing::warn!("embedding count mismatch; deferring to lazy embedding");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "candidate embedding failed; deferring");
                }
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut changes = Vec::new();
        let db = self.db.lock().await;
        for (candidate, embedding) in candidates.iter().zip(embeddings.iter()) {
            let outcome = db.upsert(
                run_id,
                candidate,
                embedding.as_deref(),
                self.cfg.dedup_similarity,
                NEAR_TOP_M,
                now_ms,
            )?;
            let change = match outcome {
                UpsertOutcome::Inserted(id) => {
                    self.audit.append(
                        "added",
                        "memory",
                        serde_json::json!({"id": id, "run_id": run_id, "text": candidate.text}),
                    )?;
                    MemoryChange::Added {
                        item_id: id,
                        text: candidate.text.clone(),
                    }
                }
                UpsertOutcome::Bumped(id) | UpsertOutcome::Merged(id) => {
                    self.audit.append(
                        "modified",
                        "memory",
                        serde_json::json!({"id": id, "run_id": run_id}),
                    )?;
                    MemoryChange::Modified { item_id: id }
                }
            };
            changes.push(change);
        }
        Ok(changes)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Queries & mutations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        provider: Option<&dyn LlmProvider>,
    ) -> Result<Vec<MemoryItem>> {
        let query_embedding = match provider {
            Some(p) if self.cfg.embeddings.enabled => {
                let req = EmbeddingsRequest {
                    input: vec![query.to_string()],
                    model: Some(self.cfg.embeddings.model.clone()),
                };
                match p.embeddings(req).await {
                    Ok(mut resp) if !resp.embeddings.is_empty() => {
                        Some(resp.embeddings.swap_remove(0))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        let db = self.db.lock().await;
        self.hybrid_search(&db, query, query_embedding.as_deref(), limit)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        self.db.lock().await.list_recent(limit)
    }

    /// Delete one item by id. Never called by the LLM except through the
    /// `ask`-gated `memory.delete` capability.
    pub async fn delete(&self, item_id: &str) -> Result<Option<MemoryChange>> {
        let removed = self.db.lock().await.delete_by_fingerprint(item_id)?;
        if !removed {
            return Ok(None);
        }
        self.audit
            .append("removed", "memory", serde_json::json!({"id": item_id}))?;
        Ok(Some(MemoryChange::Removed {
            item_id: item_id.to_string(),
        }))
    }

    /// Pin a line of always-loaded memory. Returns a change only when the
    /// text was new.
    pub fn pin(&self, text: &str) -> Result<Option<MemoryChange>> {
        let added = self.pinned.pin(text)?;
        if !added {
            return Ok(None);
        }
        self.audit
            .append("added", "pinned", serde_json::json!({"text": text}))?;
        Ok(Some(MemoryChange::Added {
            item_id: format!("pinned:{}", crate::db::fingerprint("pinned", text)),
            text: text.to_string(),
        }))
    }

    pub fn pinned_items(&self) -> Vec<crate::pinned::PinnedItem> {
        self.pinned.list()
    }

    pub async fn item_count(&self) -> Result<usize> {
        self.db.lock().await.count_items()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Maintenance
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Embed one batch of items that were inserted without vectors.
    /// Returns the number embedded.
    pub async fn embed_pending(&self, provider: &dyn LlmProvider) -> Result<usize> {
        if !self.cfg.embeddings.enabled {
            return Ok(0);
        }
        let pending = {
            let db = self.db.lock().await;
            db.pending_embeddings(self.cfg.embeddings.batch_size)?
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let req = EmbeddingsRequest {
            input: pending.iter().map(|(_, text)| text.clone()).collect(),
            model: Some(self.cfg.embeddings.model.clone()),
        };
        let resp = provider.embeddings(req).await?;
        if resp.embeddings.len() != pending.len() {
            return Ok(0);
        }

        let rows: Vec<(i64, Vec<f32>)> = pending
            .iter()
            .map(|(rowid, _)| *rowid)
            .zip(resp.embeddings)
            .collect();
        let db = self.db.lock().await;
        db.write_embeddings(&rows, &self.cfg.embeddings.model)
    }

    /// Rotate and prune the audit trail.
    pub fn rotate_audit(&self, rotation: &LogRotation) -> Result<(bool, usize)> {
        self.audit.rotate_and_prune(rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingest_without_provider_archives_turn_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = MemoryService::open_in_dir(dir.path());

        let changes = svc
            .ingest("run_1", "ws:cli", "what's the weather", "sunny", None)
            .await
            .unwrap();
        assert!(changes.is_empty());

        let packet = svc
            .build_packet("ws:cli", "weather", None)
            .await
            .unwrap();
        assert_eq!(packet.recent_turns.len(), 1);
        assert_eq!(packet.recent_turns[0].assistant_text, "sunny");
    }

    #[tokio::test]
    async fn packet_scopes_recent_turns_by_origin() {
        let dir = tempfile::tempdir().unwrap();
        let svc = MemoryService::open_in_dir(dir.path());

        svc.ingest("r1", "ws:a", "alpha question", "alpha answer", None)
            .await
            .unwrap();
        svc.ingest("r2", "telegram:9", "beta question", "beta answer", None)
            .await
            .unwrap();

        let packet = svc.build_packet("ws:a", "unrelated", None).await.unwrap();
        assert_eq!(packet.recent_turns.len(), 1);
        assert_eq!(packet.recent_turns[0].origin, "ws:a");
    }

    #[tokio::test]
    async fn pin_is_idempotent_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let svc = MemoryService::open_in_dir(dir.path());

        let first = svc.pin("Telegram client is an adapter frontend.").unwrap();
        assert!(matches!(first, Some(MemoryChange::Added { .. })));
        let second = svc.pin("Telegram client is an adapter frontend.").unwrap();
        assert!(second.is_none());
        assert_eq!(svc.pinned_items().len(), 1);

        let audit = std::fs::read_to_string(dir.path().join("memory_events.jsonl")).unwrap();
        assert_eq!(audit.lines().count(), 1);
    }

    #[tokio::test]
    async fn delete_missing_item_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let svc = MemoryService::open_in_dir(dir.path());
        assert!(svc.delete("nope").await.unwrap().is_none());
    }
}
