//! Server-sent-events decoding for streaming chat responses.
//!
//! [`SseBuffer`] is a line-oriented decoder: it eats raw body bytes,
//! tracks the partial trailing line across chunk boundaries, collects
//! the `data:` lines of the event in progress, and yields one payload
//! string per blank-line terminator (multi-line data joined with
//! newlines, as the SSE spec prescribes). Comments (leading `:`) and
//! non-data fields (`event:`, `id:`, `retry:`) are dropped.
//!
//! [`decode_sse`] turns a `reqwest::Response` plus a payload handler
//! into a [`BoxStream`] of chat events. The handler is `FnMut` so it
//! can keep state across payloads (the chat adapter correlates
//! tool-call argument fragments with earlier ids that way). A stream
//! that ends without a terminal event simply ends; consumers treat
//! exhaustion as completion.

use futures_util::StreamExt;

use crate::from_reqwest;
use vx_domain::error::Result;
use vx_domain::stream::{BoxStream, StreamEvent};

/// Incremental SSE decoder state.
#[derive(Default)]
pub(crate) struct SseBuffer {
    /// Bytes of the current, not-yet-terminated line.
    partial: String,
    /// `data:` payload lines of the event in progress.
    data: Vec<String>,
}

impl SseBuffer {
    /// Consume a body chunk; return every event payload it completed.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut payloads = Vec::new();
        self.partial.push_str(chunk);

        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the event in progress.
                if !self.data.is_empty() {
                    payloads.push(std::mem::take(&mut self.data).join("\n"));
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                if !value.is_empty() {
                    self.data.push(value.to_string());
                }
            }
            // Comments and other fields carry nothing we use.
        }

        payloads
    }

    /// Recover a final event from an unterminated body tail.
    pub(crate) fn flush(&mut self) -> Option<String> {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            let line = line.trim_end_matches('\r');
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                if !value.is_empty() {
                    self.data.push(value.to_string());
                }
            }
        }
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        }
    }
}

/// Decode a streaming response body into chat events.
pub(crate) fn decode_sse<F>(
    response: reqwest::Response,
    mut handle_payload: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseBuffer::default();

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            };
            for payload in decoder.feed(&String::from_utf8_lossy(&bytes)) {
                for event in handle_payload(&payload) {
                    yield event;
                }
            }
        }

        if let Some(tail) = decoder.flush() {
            for event in handle_payload(&tail) {
                yield event;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_event_per_blank_line() {
        let mut buf = SseBuffer::default();
        let payloads = buf.feed("data: alpha\n\ndata: beta\n\n");
        assert_eq!(payloads, vec!["alpha", "beta"]);
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut buf = SseBuffer::default();
        let payloads = buf.feed("data: line one\ndata: line two\n\n");
        assert_eq!(payloads, vec!["line one\nline two"]);
    }

    #[test]
    fn event_split_across_chunks() {
        let mut buf = SseBuffer::default();
        assert!(buf.feed("data: {\"par").is_empty());
        assert!(buf.feed("tial\":true}").is_empty());
        let payloads = buf.feed("\n\n");
        assert_eq!(payloads, vec!["{\"partial\":true}"]);
    }

    #[test]
    fn crlf_terminators_are_stripped() {
        let mut buf = SseBuffer::default();
        let payloads = buf.feed("data: windows\r\n\r\n");
        assert_eq!(payloads, vec!["windows"]);
    }

    #[test]
    fn comments_and_other_fields_are_dropped() {
        let mut buf = SseBuffer::default();
        let payloads = buf.feed(": keepalive\nevent: delta\nid: 7\nretry: 100\ndata: kept\n\n");
        assert_eq!(payloads, vec!["kept"]);
    }

    #[test]
    fn blank_line_without_data_yields_nothing() {
        let mut buf = SseBuffer::default();
        assert!(buf.feed("\n\n: ping\n\n").is_empty());
    }

    #[test]
    fn flush_recovers_unterminated_tail() {
        let mut buf = SseBuffer::default();
        assert!(buf.feed("data: cut off").is_empty());
        assert_eq!(buf.flush().as_deref(), Some("cut off"));
        // A second flush has nothing left.
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn only_first_leading_space_is_trimmed() {
        let mut buf = SseBuffer::default();
        let payloads = buf.feed("data:  two spaces\n\n");
        assert_eq!(payloads, vec![" two spaces"]);
    }
}
