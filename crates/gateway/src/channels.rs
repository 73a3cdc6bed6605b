//! Channel registry — one outbound sender per connected client endpoint.
//!
//! Events from a run are delivered only to the run's origin channel; there
//! is no cross-channel broadcast. A channel id is stable across reconnects
//! of the same client identity, so replay and pending-permission re-emits
//! land on the new connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ab_protocol::Frame;

const OUTBOUND_BUFFER: usize = 256;

struct Entry {
    tx: mpsc::Sender<Frame>,
    generation: u64,
}

pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Entry>>,
    generations: AtomicU64,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the outbound side of a channel. Replacing
    /// drops the previous sender, which ends the old writer task. The
    /// returned generation tags this registration for [`remove`].
    pub fn register(&self, channel_id: &str) -> (mpsc::Receiver<Frame>, u64) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.channels
            .lock()
            .insert(channel_id.to_owned(), Entry { tx, generation });
        (rx, generation)
    }

    /// Remove a channel, but only if it still belongs to `generation` — a
    /// reconnect that already replaced the entry is left alone.
    pub fn remove(&self, channel_id: &str, generation: u64) {
        let mut channels = self.channels.lock();
        if channels
            .get(channel_id)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
        {
            channels.remove(channel_id);
        }
    }

    pub fn is_connected(&self, channel_id: &str) -> bool {
        self.channels.lock().contains_key(channel_id)
    }

    pub fn connection_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Deliver a frame to one channel. Returns `false` when the channel is
    /// not connected or its buffer overflowed — the event is still in the
    /// log and replayable, so a slow consumer only loses liveness.
    pub fn send(&self, channel_id: &str, frame: Frame) -> bool {
        let tx = match self.channels.lock().get(channel_id) {
            Some(entry) => entry.tx.clone(),
            None => return false,
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel = channel_id, "outbound buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.channels.lock().remove(channel_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reaches_registered_channel() {
        let reg = ChannelRegistry::new();
        let (mut rx, _gen) = reg.register("ws:cli");
        assert!(reg.send("ws:cli", Frame::res_ok("1", serde_json::json!({}))));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn send_to_unknown_channel_is_false() {
        let reg = ChannelRegistry::new();
        assert!(!reg.send("nope", Frame::res_ok("1", serde_json::json!({}))));
    }

    #[test]
    fn reregister_replaces_sender() {
        let reg = ChannelRegistry::new();
        let (mut old_rx, old_gen) = reg.register("ws:cli");
        let (mut new_rx, _new_gen) = reg.register("ws:cli");
        assert_eq!(reg.connection_count(), 1);

        reg.send("ws:cli", Frame::res_ok("1", serde_json::json!({})));
        assert!(new_rx.try_recv().is_ok());
        // Old receiver's sender was dropped on replace.
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // Stale removal from the old connection must not evict the new one.
        reg.remove("ws:cli", old_gen);
        assert!(reg.is_connected("ws:cli"));
    }

    #[test]
    fn remove_with_matching_generation() {
        let reg = ChannelRegistry::new();
        let (_rx, generation) = reg.register("ws:cli");
        reg.remove("ws:cli", generation);
        assert!(!reg.is_connected("ws:cli"));
    }

    #[test]
    fn closed_receiver_is_cleaned_up_on_send() {
        let reg = ChannelRegistry::new();
        let (rx, _gen) = reg.register("ws:cli");
        drop(rx);
        assert!(!reg.send("ws:cli", Frame::res_ok("1", serde_json::json!({}))));
        assert!(!reg.is_connected("ws:cli"));
    }
}
