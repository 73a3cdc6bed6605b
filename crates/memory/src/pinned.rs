//! Pinned memory: a small always-loaded set persisted as a JSON snapshot.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ab_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedItem {
    pub text: String,
    pub created_at_ms: i64,
    pub last_seen_at_ms: i64,
}

pub struct PinnedStore {
    path: PathBuf,
    items: RwLock<Vec<PinnedItem>>,
}

impl PinnedStore {
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let items = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            items: RwLock::new(items),
        })
    }

    /// Pin a line of text. Identical text is deduplicated: the second call
    /// only bumps `last_seen_at`. Returns `true` when a new item was added.
    pub fn pin(&self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Other("cannot pin empty text".into()));
        }
        let now = Utc::now().timestamp_millis();
        let added = {
            let mut items = self.items.write();
            if let Some(existing) = items.iter_mut().find(|i| i.text == text) {
                existing.last_seen_at_ms = now;
                false
            } else {
                items.push(PinnedItem {
                    text: text.to_string(),
                    created_at_ms: now,
                    last_seen_at_ms: now,
                });
                true
            }
        };
        self.persist()?;
        Ok(added)
    }

    pub fn remove(&self, text: &str) -> Result<bool> {
        let removed = {
            let mut items = self.items.write();
            let before = items.len();
            items.retain(|i| i.text != text);
            items.len() != before
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<PinnedItem> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Write-then-rename so a crash never truncates the snapshot.
    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.items.read())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_twice_is_single_item_with_bumped_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinnedStore::load(&dir.path().join("pinned.json")).unwrap();

        assert!(store
            .pin("Telegram client is an adapter frontend.")
            .unwrap());
        let first_seen = store.list()[0].last_seen_at_ms;

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!store
            .pin("Telegram client is an adapter frontend.")
            .unwrap());

        let items = store.list();
        assert_eq!(items.len(), 1);
        assert!(items[0].last_seen_at_ms >= first_seen);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinned.json");
        {
            let store = PinnedStore::load(&path).unwrap();
            store.pin("remember me").unwrap();
        }
        let store = PinnedStore::load(&path).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].text, "remember me");
    }

    #[test]
    fn empty_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinnedStore::load(&dir.path().join("pinned.json")).unwrap();
        assert!(store.pin("   ").is_err());
    }

    #[test]
    fn remove_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinnedStore::load(&dir.path().join("pinned.json")).unwrap();
        store.pin("a").unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.is_empty());
    }
}
