//! Server-sent-events plumbing shared by provider adapters.
//!
//! The adapter hands a `reqwest::Response` plus a parser closure to
//! [`sse_event_stream`]; the buffer logic here splits the byte stream into
//! complete `data:` payloads and flushes any trailing partial event when the
//! body closes. A fallback `Done` is emitted if the parser never produced one,
//! so the executor's stream loop always terminates cleanly.

use ab_domain::error::Result;
use ab_domain::stream::{BoxStream, StreamEvent};

use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates raw chunks and yields complete `data:` payloads.
///
/// SSE events are delimited by `\n\n`; each block may contain `event:`,
/// `data:`, `id:`, or `retry:` lines — only `data:` lines matter here.
#[derive(Default)]
pub(crate) struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Drain every complete event block; a trailing partial stays buffered.
    pub fn drain_events(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..pos).collect();
            self.buf.drain(..2);
            for line in block.lines() {
                if let Some(data) = line.trim().strip_prefix("data:") {
                    let data = data.trim();
                    if !data.is_empty() {
                        payloads.push(data.to_string());
                    }
                }
            }
        }
        payloads
    }

    /// Force out whatever is left (called once when the body ends).
    pub fn flush(&mut self) -> Vec<String> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return Vec::new();
        }
        self.buf.push_str("\n\n");
        self.drain_events()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response → event stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a [`BoxStream`] from an SSE response and a parser closure.
///
/// The closure is `FnMut` because tool-call assembly needs state across
/// payloads on some wire formats.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = SseBuffer::default();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push(&bytes);
                    for data in buffer.drain_events() {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    for data in buffer.flush() {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_with(s: &str) -> SseBuffer {
        let mut b = SseBuffer::default();
        b.push(s.as_bytes());
        b
    }

    #[test]
    fn single_complete_event() {
        let mut b = buf_with("event: message\ndata: {\"hello\":\"world\"}\n\n");
        assert_eq!(b.drain_events(), vec!["{\"hello\":\"world\"}"]);
        assert!(b.drain_events().is_empty());
    }

    #[test]
    fn multiple_events() {
        let mut b = buf_with("data: first\n\ndata: second\n\n");
        assert_eq!(b.drain_events(), vec!["first", "second"]);
    }

    #[test]
    fn partial_event_stays_buffered() {
        let mut b = buf_with("data: complete\n\ndata: partial");
        assert_eq!(b.drain_events(), vec!["complete"]);
        // Completing the block later yields the rest.
        b.push("\n\n".as_bytes());
        assert_eq!(b.drain_events(), vec!["partial"]);
    }

    #[test]
    fn flush_forces_trailing_partial() {
        let mut b = buf_with("data: tail");
        assert!(b.drain_events().is_empty());
        assert_eq!(b.flush(), vec!["tail"]);
    }

    #[test]
    fn flush_of_whitespace_is_empty() {
        let mut b = buf_with("  \n");
        assert!(b.flush().is_empty());
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut b = buf_with("event: ping\nid: 42\nretry: 5000\ndata: payload\n\n");
        assert_eq!(b.drain_events(), vec!["payload"]);
    }

    #[test]
    fn skips_empty_data_lines() {
        let mut b = buf_with("data: \n\n");
        assert!(b.drain_events().is_empty());
    }

    #[test]
    fn done_sentinel_preserved() {
        let mut b = buf_with("data: [DONE]\n\n");
        assert_eq!(b.drain_events(), vec!["[DONE]"]);
    }

    #[test]
    fn incremental_chunks_across_event_boundary() {
        let mut b = SseBuffer::default();
        b.push(b"data: chu");
        assert!(b.drain_events().is_empty());
        b.push(b"nk1\n\ndata: chunk2\n\n");
        assert_eq!(b.drain_events(), vec!["chunk1", "chunk2"]);
    }
}
