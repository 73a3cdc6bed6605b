//! SQLite-backed consolidated memory state:
//! - `memory_items` deduped by fingerprint, with an FTS5 index for BM25
//! - embeddings stored as little-endian f32 blobs (no vector extension)
//! - a `turns` archive with its own FTS5 index for related-turn recall

use std::path::Path;

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use ab_domain::error::{Error, Result};

use crate::types::{ExtractedMemory, MemoryItem, TurnPair};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprints & vectors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Dedup fingerprint over kind + normalized text.
pub fn fingerprint(kind: &str, text: &str) -> String {
    let raw = format!("{kind}:{}", normalize_text(text));
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

fn pack_f32(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn unpack_f32(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hybrid scoring weights
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// score = ALPHA * bm25 + (1 - ALPHA) * cosine + BETA * recency
const ALPHA: f32 = 0.55;
const BETA: f32 = 0.2;
/// Recency decays to zero over this horizon.
const RECENCY_HORIZON_DAYS: f32 = 30.0;

/// Map an FTS5 bm25 score (lower is better, usually negative) into [0, 1].
fn lexical_score(bm25: f64) -> f32 {
    let a = bm25.abs() as f32;
    ((2.0 - a.min(2.0)) / 2.0).clamp(0.0, 1.0)
}

fn recency_score(last_seen_ms: i64, now_ms: i64) -> f32 {
    if last_seen_ms <= 0 {
        return 0.0;
    }
    let age_days = ((now_ms - last_seen_ms).max(0) as f32) / 86_400_000.0;
    (1.0 - age_days / RECENCY_HORIZON_DAYS).clamp(0.0, 1.0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryDb
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What an upsert did to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(String),
    /// Exact-fingerprint hit: last_seen bumped.
    Bumped(String),
    /// Near-duplicate merged into an existing item.
    Merged(String),
}

pub struct MemoryDb {
    con: Connection,
}

impl MemoryDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let con = Connection::open(path).map_err(db_err)?;
        con.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        con.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        let db = Self { con };
        db.init_schema()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let con = Connection::open_in_memory().map_err(db_err)?;
        let db = Self { con };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.con
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS memory_items (
                  rowid INTEGER PRIMARY KEY,
                  fingerprint TEXT NOT NULL UNIQUE,
                  kind TEXT NOT NULL,
                  text TEXT NOT NULL,
                  context TEXT NOT NULL DEFAULT '',
                  importance REAL NOT NULL DEFAULT 0,
                  tags_json TEXT NOT NULL DEFAULT '[]',
                  created_ms INTEGER NOT NULL,
                  last_seen_ms INTEGER NOT NULL,
                  count INTEGER NOT NULL DEFAULT 1,
                  last_run_id TEXT NOT NULL DEFAULT '',
                  embedding BLOB,
                  embedding_model TEXT NOT NULL DEFAULT '',
                  embedding_status TEXT NOT NULL DEFAULT 'missing'
                );

                CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
                USING fts5(text, context, tags, content='memory_items', content_rowid='rowid');

                CREATE TRIGGER IF NOT EXISTS memory_items_ai AFTER INSERT ON memory_items BEGIN
                  INSERT INTO memory_fts(rowid, text, context, tags)
                  VALUES (new.rowid, new.text, new.context, new.tags_json);
                END;
                CREATE TRIGGER IF NOT EXISTS memory_items_ad AFTER DELETE ON memory_items BEGIN
                  INSERT INTO memory_fts(memory_fts, rowid, text, context, tags)
                  VALUES('delete', old.rowid, old.text, old.context, old.tags_json);
                END;
                CREATE TRIGGER IF NOT EXISTS memory_items_au AFTER UPDATE ON memory_items BEGIN
                  INSERT INTO memory_fts(memory_fts, rowid, text, context, tags)
                  VALUES('delete', old.rowid, old.text, old.context, old.tags_json);
                  INSERT INTO memory_fts(rowid, text, context, tags)
                  VALUES (new.rowid, new.text, new.context, new.tags_json);
                END;

                CREATE TABLE IF NOT EXISTS turns (
                  rowid INTEGER PRIMARY KEY,
                  origin TEXT NOT NULL,
                  user_text TEXT NOT NULL,
                  assistant_text TEXT NOT NULL,
                  created_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS turns_origin_idx ON turns(origin, created_ms);

                CREATE VIRTUAL TABLE IF NOT EXISTS turns_fts
                USING fts5(user_text, assistant_text, content='turns', content_rowid='rowid');

                CREATE TRIGGER IF NOT EXISTS turns_ai AFTER INSERT ON turns BEGIN
                  INSERT INTO turns_fts(rowid, user_text, assistant_text)
                  VALUES (new.rowid, new.user_text, new.assistant_text);
                END;
                CREATE TRIGGER IF NOT EXISTS turns_ad AFTER DELETE ON turns BEGIN
                  INSERT INTO turns_fts(turns_fts, rowid, user_text, assistant_text)
                  VALUES('delete', old.rowid, old.user_text, old.assistant_text);
                END;
                "#,
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn count_items(&self) -> Result<usize> {
        let n: i64 = self
            .con
            .query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    // ── Upsert / consolidation ────────────────────────────────────────

    /// Consolidate one extracted candidate.
    ///
    /// Exact fingerprint hit bumps `last_seen`/`count` and takes the max
    /// importance. Otherwise, when a candidate embedding is supplied, the
    /// top-`near_top_m` cosine neighbours above `similarity_threshold` are
    /// checked and the candidate merges into the best hit (longer text wins,
    /// max importance, tag union). Everything else inserts fresh.
    pub fn upsert(
        &self,
        run_id: &str,
        candidate: &ExtractedMemory,
        candidate_embedding: Option<&[f32]>,
        similarity_threshold: f32,
        near_top_m: usize,
        now_ms: i64,
    ) -> Result<UpsertOutcome> {
        let fp = fingerprint(&candidate.kind, &candidate.text);

        // Exact-hash hit.
        if let Some(existing) = self.get_by_fingerprint(&fp)? {
            self.con
                .execute(
                    r#"UPDATE memory_items
                       SET last_seen_ms = ?1,
                           count = count + 1,
                           importance = MAX(importance, ?2),
                           last_run_id = ?3
                       WHERE fingerprint = ?4"#,
                    rusqlite::params![now_ms, candidate.importance as f64, run_id, fp],
                )
                .map_err(db_err)?;
            return Ok(UpsertOutcome::Bumped(existing.item_id));
        }

        // Near-duplicate check (only possible with a candidate embedding).
        if let Some(embedding) = candidate_embedding {
            let neighbours = self.vector_candidates(embedding, 2000, near_top_m)?;
            if let Some((rowid, sim)) = neighbours.first() {
                if *sim >= similarity_threshold {
                    return self.merge_into(*rowid, candidate, run_id, now_ms);
                }
            }
        }

        // Fresh insert; embedding is written when supplied, queued otherwise.
        let tags_json = serde_json::to_string(&candidate.tags)?;
        let (blob, status): (Option<Vec<u8>>, &str) = match candidate_embedding {
            Some(e) => (Some(pack_f32(e)), "fresh"),
            None => (None, "missing"),
        };
        self.con
            .execute(
                r#"INSERT INTO memory_items
                   (fingerprint, kind, text, context, importance, tags_json,
                    created_ms, last_seen_ms, count, last_run_id, embedding, embedding_status)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, ?8, ?9, ?10)"#,
                rusqlite::params![
                    fp,
                    candidate.kind,
                    candidate.text,
                    candidate.context,
                    candidate.importance as f64,
                    tags_json,
                    now_ms,
                    run_id,
                    blob,
                    status,
                ],
            )
            .map_err(db_err)?;
        Ok(UpsertOutcome::Inserted(fp))
    }

    /// Merge a candidate into an existing near-duplicate row: keep the longer
    /// text, take the max importance, union the tags. A text change marks the
    /// embedding dirty so the maintenance loop re-embeds it.
    fn merge_into(
        &self,
        rowid: i64,
        candidate: &ExtractedMemory,
        run_id: &str,
        now_ms: i64,
    ) -> Result<UpsertOutcome> {
        let (fp, old_text, old_tags_json): (String, String, String) = self
            .con
            .query_row(
                "SELECT fingerprint, text, tags_json FROM memory_items WHERE rowid = ?1",
                [rowid],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(db_err)?;

        let keep_new_text = candidate.text.len() > old_text.len();
        let merged_text = if keep_new_text { &candidate.text } else { &old_text };

        let mut tags: Vec<String> =
            serde_json::from_str(&old_tags_json).unwrap_or_default();
        for t in &candidate.tags {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        tags.sort();
        let tags_json = serde_json::to_string(&tags)?;

        self.con
            .execute(
                r#"UPDATE memory_items
                   SET text = ?1,
                       importance = MAX(importance, ?2),
                       tags_json = ?3,
                       last_seen_ms = ?4,
                       count = count + 1,
                       last_run_id = ?5,
                       embedding_status = CASE WHEN ?6 THEN 'dirty' ELSE embedding_status END
                   WHERE rowid = ?7"#,
                rusqlite::params![
                    merged_text,
                    candidate.importance as f64,
                    tags_json,
                    now_ms,
                    run_id,
                    keep_new_text,
                    rowid,
                ],
            )
            .map_err(db_err)?;
        Ok(UpsertOutcome::Merged(fp))
    }

    // ── Lookup / delete ───────────────────────────────────────────────

    pub fn get_by_fingerprint(&self, fp: &str) -> Result<Option<MemoryItem>> {
        let mut stmt = self
            .con
            .prepare(
                "SELECT fingerprint, kind, text, context, importance, tags_json,
                        created_ms, last_seen_ms, count
                 FROM memory_items WHERE fingerprint = ?1",
            )
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map([fp], row_to_item)
            .map_err(db_err)?;
        match rows.next() {
            Some(item) => Ok(Some(item.map_err(db_err)?)),
            None => Ok(None),
        }
    }

    pub fn delete_by_fingerprint(&self, fp: &str) -> Result<bool> {
        let n = self
            .con
            .execute("DELETE FROM memory_items WHERE fingerprint = ?1", [fp])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        let mut stmt = self
            .con
            .prepare(
                "SELECT fingerprint, kind, text, context, importance, tags_json,
                        created_ms, last_seen_ms, count
                 FROM memory_items ORDER BY last_seen_ms DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([limit as i64], row_to_item)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    // ── Candidate generation ──────────────────────────────────────────

    /// BM25 candidates, lower score = better. Falls back to a LIKE scan when
    /// the FTS query string doesn't parse.
    pub fn search_bm25(&self, query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let q = query.trim();
        if q.is_empty() {
            return Ok(Vec::new());
        }
        let fts = self.con.prepare(
            "SELECT rowid, bm25(memory_fts) AS score
             FROM memory_fts WHERE memory_fts MATCH ?1
             ORDER BY score LIMIT ?2",
        );
        if let Ok(mut stmt) = fts {
            let result = stmt
                .query_map(rusqlite::params![fts_query(q), limit as i64], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
                })
                .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>());
            if let Ok(hits) = result {
                return Ok(hits);
            }
        }
        // Fallback LIKE scan.
        let pattern = format!("%{q}%");
        let mut stmt = self
            .con
            .prepare(
                "SELECT rowid, 1.0 FROM memory_items
                 WHERE text LIKE ?1 OR context LIKE ?1
                 ORDER BY last_seen_ms DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![pattern, limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    /// Vector candidates without a dedicated index: scan the most recent
    /// `scan_limit` embedded items, cosine against the query, keep `top_k`.
    /// Recall cost is bounded regardless of store size.
    pub fn vector_candidates(
        &self,
        query_embedding: &[f32],
        scan_limit: usize,
        top_k: usize,
    ) -> Result<Vec<(i64, f32)>> {
        if query_embedding.is_empty() || scan_limit == 0 || top_k == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .con
            .prepare(
                "SELECT rowid, embedding FROM memory_items
                 WHERE embedding IS NOT NULL
                 ORDER BY last_seen_ms DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([scan_limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_err)?;

        let mut scored: Vec<(i64, f32)> = Vec::new();
        for row in rows {
            let (rowid, blob) = row.map_err(db_err)?;
            let sim = cosine(query_embedding, &unpack_f32(&blob));
            if sim > 0.0 {
                scored.push((rowid, sim));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Union the BM25 and vector candidate sets and rerank with the hybrid
    /// score. Returns the top `limit` items.
    pub fn hybrid_rank(
        &self,
        bm: &[(i64, f64)],
        vec: &[(i64, f32)],
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<MemoryItem>> {
        let mut rowids: Vec<i64> = bm.iter().map(|(r, _)| *r).collect();
        for (r, _) in vec {
            if !rowids.contains(r) {
                rowids.push(*r);
            }
        }
        if rowids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("?")
            .take(rowids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT rowid, fingerprint, kind, text, context, importance, tags_json,
                    created_ms, last_seen_ms, count
             FROM memory_items WHERE rowid IN ({placeholders})"
        );
        let mut stmt = self.con.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(rowids.iter()), |r| {
                let rowid: i64 = r.get(0)?;
                Ok((
                    rowid,
                    MemoryItem {
                        item_id: r.get(1)?,
                        kind: r.get(2)?,
                        text: r.get(3)?,
                        context: r.get(4)?,
                        importance: r.get::<_, f64>(5)? as f32,
                        tags: serde_json::from_str(&r.get::<_, String>(6)?)
                            .unwrap_or_default(),
                        created_at_ms: r.get(7)?,
                        last_seen_at_ms: r.get(8)?,
                        count: r.get::<_, i64>(9)? as u32,
                    },
                ))
            })
            .map_err(db_err)?;

        let bm_by: std::collections::HashMap<i64, f64> = bm.iter().copied().collect();
        let vec_by: std::collections::HashMap<i64, f32> = vec.iter().copied().collect();

        let mut scored: Vec<(f32, MemoryItem)> = Vec::new();
        for row in rows {
            let (rowid, item) = row.map_err(db_err)?;
            let lexical = bm_by.get(&rowid).copied().map(lexical_score).unwrap_or(0.0);
            let sim = vec_by.get(&rowid).copied().unwrap_or(0.0);
            let recency = recency_score(item.last_seen_at_ms, now_ms);
            let score = ALPHA * lexical + (1.0 - ALPHA) * sim + BETA * recency;
            scored.push((score, item));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, i)| i).collect())
    }

    // ── Embedding maintenance ─────────────────────────────────────────

    /// Items whose embedding is missing or stale, most recent first.
    pub fn pending_embeddings(&self, limit: usize) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .con
            .prepare(
                "SELECT rowid, kind || ' ' || text || ' ' || context
                 FROM memory_items
                 WHERE embedding_status IN ('missing', 'dirty')
                 ORDER BY last_seen_ms DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([limit as i64], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn write_embeddings(&self, rows: &[(i64, Vec<f32>)], model: &str) -> Result<usize> {
        for (rowid, vec) in rows {
            self.con
                .execute(
                    "UPDATE memory_items
                     SET embedding = ?1, embedding_model = ?2, embedding_status = 'fresh'
                     WHERE rowid = ?3",
                    rusqlite::params![pack_f32(vec), model, rowid],
                )
                .map_err(db_err)?;
        }
        Ok(rows.len())
    }

    // ── Turn archive ──────────────────────────────────────────────────

    pub fn insert_turn(&self, turn: &TurnPair) -> Result<()> {
        self.con
            .execute(
                "INSERT INTO turns (origin, user_text, assistant_text, created_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    turn.origin,
                    turn.user_text,
                    turn.assistant_text,
                    turn.created_at_ms
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Last `limit` exchanges for an origin, oldest first.
    pub fn recent_turns(&self, origin: &str, limit: usize) -> Result<Vec<TurnPair>> {
        let mut stmt = self
            .con
            .prepare(
                "SELECT origin, user_text, assistant_text, created_ms FROM turns
                 WHERE origin = ?1 ORDER BY created_ms DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![origin, limit as i64], row_to_turn)
            .map_err(db_err)?;
        let mut turns = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        turns.reverse();
        Ok(turns)
    }

    /// Similar past exchanges by BM25, excluding the requesting origin's own
    /// most recent window (those come back via `recent_turns`).
    pub fn related_turns(
        &self,
        query: &str,
        exclude_origin: &str,
        limit: usize,
    ) -> Result<Vec<TurnPair>> {
        let q = query.trim();
        if q.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let fts = self.con.prepare(
            "SELECT t.origin, t.user_text, t.assistant_text, t.created_ms
             FROM turns_fts f JOIN turns t ON t.rowid = f.rowid
             WHERE turns_fts MATCH ?1 AND t.origin != ?2
             ORDER BY bm25(turns_fts) LIMIT ?3",
        );
        if let Ok(mut stmt) = fts {
            let result = stmt
                .query_map(
                    rusqlite::params![fts_query(q), exclude_origin, limit as i64],
                    row_to_turn,
                )
                .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>());
            if let Ok(turns) = result {
                return Ok(turns);
            }
        }
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mappers & helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_item(r: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    Ok(MemoryItem {
        item_id: r.get(0)?,
        kind: r.get(1)?,
        text: r.get(2)?,
        context: r.get(3)?,
        importance: r.get::<_, f64>(4)? as f32,
        tags: serde_json::from_str(&r.get::<_, String>(5)?).unwrap_or_default(),
        created_at_ms: r.get(6)?,
        last_seen_at_ms: r.get(7)?,
        count: r.get::<_, i64>(8)? as u32,
    })
}

fn row_to_turn(r: &rusqlite::Row<'_>) -> rusqlite::Result<TurnPair> {
    Ok(TurnPair {
        origin: r.get(0)?,
        user_text: r.get(1)?,
        assistant_text: r.get(2)?,
        created_at_ms: r.get(3)?,
    })
}

/// Quote each term so user text can't break FTS5 query syntax.
fn fts_query(q: &str) -> String {
    q.split_whitespace()
        .map(|w| format!("\"{}\"", w.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn db_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Other(format!("memory db: {e}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str) -> ExtractedMemory {
        ExtractedMemory {
            kind: "fact".into(),
            text: text.into(),
            context: String::new(),
            importance: 0.7,
            tags: vec![],
        }
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize_text("  Telegram client   is an ADAPTER, frontend!  "),
            "telegram client is an adapter frontend"
        );
    }

    #[test]
    fn fingerprint_is_stable_under_normalization() {
        let a = fingerprint("fact", "User lives in Paris.");
        let b = fingerprint("fact", "  user LIVES in   paris ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, fingerprint("preference", "User lives in Paris."));
    }

    #[test]
    fn upsert_dedups_by_fingerprint() {
        let db = MemoryDb::open_in_memory().unwrap();
        let c = candidate("User prefers dark roast coffee");

        let first = db.upsert("run_1", &c, None, 0.92, 5, 1000).unwrap();
        let id = match first {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let second = db.upsert("run_2", &c, None, 0.92, 5, 2000).unwrap();
        assert_eq!(second, UpsertOutcome::Bumped(id.clone()));

        assert_eq!(db.count_items().unwrap(), 1);
        let item = db.get_by_fingerprint(&id).unwrap().unwrap();
        assert_eq!(item.count, 2);
        assert_eq!(item.last_seen_at_ms, 2000);
    }

    #[test]
    fn near_duplicate_merges_keeping_longer_text() {
        let db = MemoryDb::open_in_memory().unwrap();
        let base = candidate("User works at Acme");
        let emb = vec![1.0f32, 0.0, 0.0];
        db.upsert("run_1", &base, Some(&emb), 0.9, 5, 1000).unwrap();

        let longer = ExtractedMemory {
            tags: vec!["work".into()],
            ..candidate("User works at Acme Corporation in the platform team")
        };
        let near = vec![0.999f32, 0.01, 0.0];
        let out = db.upsert("run_2", &longer, Some(&near), 0.9, 5, 2000).unwrap();
        assert!(matches!(out, UpsertOutcome::Merged(_)));

        assert_eq!(db.count_items().unwrap(), 1);
        let items = db.list_recent(10).unwrap();
        assert!(items[0].text.contains("platform team"));
        assert!(items[0].tags.contains(&"work".to_string()));
    }

    #[test]
    fn distinct_items_both_insert() {
        let db = MemoryDb::open_in_memory().unwrap();
        let e1 = vec![1.0f32, 0.0];
        let e2 = vec![0.0f32, 1.0];
        db.upsert("r", &candidate("Likes hiking"), Some(&e1), 0.92, 5, 1).unwrap();
        db.upsert("r", &candidate("Deploys on Fridays"), Some(&e2), 0.92, 5, 2).unwrap();
        assert_eq!(db.count_items().unwrap(), 2);
    }

    #[test]
    fn bm25_finds_inserted_item() {
        let db = MemoryDb::open_in_memory().unwrap();
        db.upsert("r", &candidate("The deploy pipeline uses blue green rollout"), None, 0.92, 5, 1)
            .unwrap();
        db.upsert("r", &candidate("User's cat is named Miso"), None, 0.92, 5, 2)
            .unwrap();

        let hits = db.search_bm25("deploy rollout", 10).unwrap();
        assert!(!hits.is_empty());
        let ranked = db.hybrid_rank(&hits, &[], 5, 10_000).unwrap();
        assert!(ranked[0].text.contains("deploy"));
    }

    #[test]
    fn vector_candidates_ranked_by_cosine() {
        let db = MemoryDb::open_in_memory().unwrap();
        db.upsert("r", &candidate("alpha"), Some(&[1.0, 0.0]), 0.99, 5, 1).unwrap();
        db.upsert("r", &candidate("beta"), Some(&[0.0, 1.0]), 0.99, 5, 2).unwrap();

        let hits = db.vector_candidates(&[1.0, 0.1], 100, 10).unwrap();
        assert_eq!(hits.len(), 2);
        // alpha is closest to the query.
        let top = db.hybrid_rank(&[], &hits, 1, 10).unwrap();
        assert_eq!(top[0].text, "alpha");
    }

    #[test]
    fn delete_removes_item() {
        let db = MemoryDb::open_in_memory().unwrap();
        let c = candidate("temp note");
        let fp = match db.upsert("r", &c, None, 0.92, 5, 1).unwrap() {
            UpsertOutcome::Inserted(fp) => fp,
            other => panic!("{other:?}"),
        };
        assert!(db.delete_by_fingerprint(&fp).unwrap());
        assert!(!db.delete_by_fingerprint(&fp).unwrap());
        assert_eq!(db.count_items().unwrap(), 0);
    }

    #[test]
    fn pending_embeddings_and_write() {
        let db = MemoryDb::open_in_memory().unwrap();
        db.upsert("r", &candidate("needs embedding"), None, 0.92, 5, 1).unwrap();
        let pending = db.pending_embeddings(10).unwrap();
        assert_eq!(pending.len(), 1);

        let rows = vec![(pending[0].0, vec![0.5f32, 0.5])];
        assert_eq!(db.write_embeddings(&rows, "test-model").unwrap(), 1);
        assert!(db.pending_embeddings(10).unwrap().is_empty());
        assert_eq!(db.vector_candidates(&[0.5, 0.5], 10, 10).unwrap().len(), 1);
    }

    #[test]
    fn turn_archive_recent_and_related() {
        let db = MemoryDb::open_in_memory().unwrap();
        for i in 0..5 {
            db.insert_turn(&TurnPair {
                origin: "ws:cli".into(),
                user_text: format!("question {i} about rust lifetimes"),
                assistant_text: format!("answer {i}"),
                created_at_ms: i,
            })
            .unwrap();
        }
        db.insert_turn(&TurnPair {
            origin: "telegram:42".into(),
            user_text: "how do rust lifetimes work".into(),
            assistant_text: "borrow checker things".into(),
            created_at_ms: 99,
        })
        .unwrap();

        let recent = db.recent_turns("ws:cli", 3).unwrap();
        assert_eq!(recent.len(), 3);
        // Oldest first.
        assert!(recent[0].created_at_ms < recent[2].created_at_ms);

        let related = db.related_turns("rust lifetimes", "ws:cli", 5).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].origin, "telegram:42");
    }

    #[test]
    fn lexical_score_clamps() {
        assert!(lexical_score(0.0) > 0.99);
        assert_eq!(lexical_score(5.0), 0.0);
        assert!(lexical_score(-1.0) > 0.0);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
