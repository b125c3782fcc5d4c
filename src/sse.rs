//! Incremental decoder for `text/event-stream` bodies
//!
//! Bytes arrive in arbitrary chunks; complete events are yielded once their
//! terminating blank line has been seen.

use crate::error::ParseError;

/// Event type used when the stream does not name one
pub const DEFAULT_EVENT: &str = "message";

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Longest line or event body held while waiting for its terminator
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Line-oriented SSE decoder
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` known to contain no line terminator
    scanned: usize,
    max_pending: usize,
    /// Skipping the remainder of an oversized line
    discarding: bool,
    overflow: Option<ParseError>,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_pending(MAX_PENDING_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_pending: max_pending.max(1),
            discarding: false,
            overflow: None,
            event: None,
            data: Vec::new(),
            data_len: 0,
            id: None,
        }
    }

    /// Feed a chunk and collect every event it completes.
    ///
    /// A line or event growing past the pending limit is dropped along with
    /// the event it belongs to; [`SseDecoder::take_overflow`] reports it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut chunk = chunk;

        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return events,
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }

            start = end + 1;
            cursor = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_pending {
            let held = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
            self.overflow(format!("line exceeds {} bytes ({} held)", self.max_pending, held));
        }

        events
    }

    /// Bytes held back waiting for a line terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// The most recent overflow since the last call, if any
    pub fn take_overflow(&mut self) -> Option<ParseError> {
        self.overflow.take()
    }

    fn overflow(&mut self, reason: String) {
        tracing::warn!("Dropping event-stream input: {}", reason);
        self.event = None;
        self.id = None;
        self.data.clear();
        self.data_len = 0;
        self.overflow = Some(ParseError::MalformedMessage(reason));
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.max_pending {
                    self.overflow(format!("event data exceeds {} bytes", self.max_pending));
                } else {
                    self.data.push(value.to_string());
                }
            }
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields carry nothing we act on
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();

        if self.data.is_empty() {
            return None;
        }

        self.data_len = 0;
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id,
        })
    }
}
