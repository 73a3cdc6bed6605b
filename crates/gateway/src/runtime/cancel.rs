//! Per-run cancellation tokens with parent→child cascade.
//!
//! Cancellation is cooperative: the executor checks its token at every
//! suspension point (LLM chunk, tool dispatch, permission wait).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Active tokens keyed by run id. A parent run's group holds its worker
/// runs so cancelling the parent cascades.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Cancel a run and every child registered in its group.
    /// Returns `true` when a token was found for the run itself.
    pub fn cancel(&self, run_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(run_id) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(run_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }
        found
    }

    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
        self.groups.lock().remove(run_id);
    }

    pub fn add_child(&self, parent_run_id: &str, child_run_id: &str) {
        self.groups
            .lock()
            .entry(parent_run_id.to_owned())
            .or_default()
            .insert(child_run_id.to_owned());
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.tokens.lock().contains_key(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones share state.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let map = CancelMap::new();
        let token = map.register("run_1");
        assert!(map.cancel("run_1"));
        assert!(map.cancel("run_1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_cascades_to_children() {
        let map = CancelMap::new();
        let parent = map.register("run_p");
        let child = map.register("run_c");
        map.add_child("run_p", "run_c");

        map.cancel("run_p");
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancel_unknown_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
    }

    #[test]
    fn remove_clears_token_and_group() {
        let map = CancelMap::new();
        map.register("run_p");
        let child = map.register("run_c");
        map.add_child("run_p", "run_c");

        map.remove("run_p");
        assert!(!map.is_running("run_p"));
        map.cancel("run_p");
        assert!(!child.is_cancelled());
    }
}
