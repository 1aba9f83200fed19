//! Incremental Server-Sent-Events parser for streaming HTTP adapters.

use futures::{Stream, StreamExt};

use crate::EngineError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser: feed raw body chunks, collect completed events.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk; returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush any event left pending when the body ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Blank line dispatches the pending event.
            return self.finish();
        }
        if line.starts_with(':') {
            return None; // comment
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        }
        // Unknown fields (id:, retry:, ...) are ignored.
        None
    }
}

/// Turn a `reqwest::Response` body into a stream of SSE events.
pub fn event_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, EngineError>> {
    let body = response.bytes_stream();

    futures::stream::unfold(
        (Box::pin(body), SseParser::new(), Vec::<SseEvent>::new(), false),
        |(mut body, mut parser, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop() {
                    return Some((Ok(event), (body, parser, pending, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        let mut events = parser.feed(&chunk);
                        events.reverse(); // popped back-to-front
                        pending = events;
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(EngineError::Failed(format!("SSE stream error: {e}"))),
                            (body, parser, pending, done),
                        ));
                    }
                    None => {
                        done = true;
                        if let Some(event) = parser.finish() {
                            return Some((Ok(event), (body, parser, pending, done)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn named_event_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: delta\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("delta"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: par").is_empty());
        assert!(parser.feed(b"tial\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail\n").is_empty());
        let tail = parser.finish().unwrap();
        assert_eq!(tail.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }
}
