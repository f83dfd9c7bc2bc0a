//! Incremental Server-Sent Events parser for streamed chat completions.
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hi"}}]}
//!
//! data: [DONE]
//! ```

/// One parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// From the `event:` field, if any.
    pub event_type: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this is the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
struct Pending {
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl Pending {
    fn take(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event_type = None;
            self.id = None;
            return None;
        }
        let event = SseEvent {
            event_type: self.event_type.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event_type = Some(value.to_owned()),
            "id" => self.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }
}

/// Feed raw body chunks with [`push`](Self::push); call
/// [`flush`](Self::flush) at end of stream.
///
/// Bytes are buffered until a full line is available, so a multi-byte
/// character split across network chunks decodes correctly.
#[derive(Debug, Default)]
pub struct SseLineParser {
    buffer: Vec<u8>,
    pending: Pending,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.pending.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Emit whatever is left once the body has ended.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.pending.line(line) {
                return Some(event);
            }
        }
        self.pending.take()
    }
}
