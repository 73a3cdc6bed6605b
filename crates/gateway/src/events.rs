//! Event emission: append to the canonical log, then fan out to the run's
//! origin channel only.

use ab_domain::error::Result;
use ab_domain::event::{EventKind, EventRecord};
use ab_protocol::Frame;

use crate::state::AppState;

/// Append one event for a run and deliver it to the run's origin channel.
/// The append is durable before anything is delivered; a disconnected
/// channel just means the event waits in the log for replay.
pub fn emit(state: &AppState, run_id: &str, event: EventKind) -> Result<EventRecord> {
    let record = state.event_log.append(run_id, event)?;
    state.runs.record_event_seq(run_id, record.seq);

    if let Some(channel) = state
        .runs
        .get(run_id)
        .and_then(|r| r.origin_channel)
    {
        state.channels.send(&channel, Frame::from_record(&record));
    }
    Ok(record)
}

/// Emit the canonical event for a memory store mutation.
pub fn emit_memory_change(state: &AppState, run_id: &str, change: &ab_memory::MemoryChange) {
    let kind = match change {
        ab_memory::MemoryChange::Added { item_id, text } => EventKind::MemoryAdded {
            item_id: item_id.clone(),
            text: text.clone(),
        },
        ab_memory::MemoryChange::Modified { item_id } => EventKind::MemoryModified {
            item_id: item_id.clone(),
        },
        ab_memory::MemoryChange::Removed { item_id } => EventKind::MemoryRemoved {
            item_id: item_id.clone(),
        },
    };
    if let Err(e) = emit(state, run_id, kind) {
        tracing::warn!(error = %e, "failed to append memory event");
    }
}

/// Emit an operational line tied to no client channel (supervisor ticks).
pub fn emit_log_line(state: &AppState, run_id: &str, message: impl Into<String>) {
    if let Err(e) = emit(
        state,
        run_id,
        EventKind::RunLog {
            message: message.into(),
        },
    ) {
        tracing::warn!(error = %e, "failed to append log event");
    }
}

/// Replay events newer than `last_seq` whose runs originated on `channel`,
/// bounded to a recent window.
pub fn replay_to_channel(state: &AppState, channel: &str, last_seq: u64) -> usize {
    const REPLAY_WINDOW: usize = 500;
    let records = match state.event_log.scan(last_seq, REPLAY_WINDOW) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "replay scan failed");
            return 0;
        }
    };

    let mut sent = 0;
    for record in &records {
        let belongs_here = state
            .runs
            .get(&record.run_id)
            .and_then(|r| r.origin_channel)
            .map(|c| c == channel)
            .unwrap_or(false);
        if belongs_here && state.channels.send(channel, Frame::from_record(record)) {
            sent += 1;
        }
    }
    sent
}
