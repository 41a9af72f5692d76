//! Incremental decoder for `text/event-stream` payloads.
//!
//! Shared by the SSE client transport and the streamable-HTTP client,
//! which may receive its responses as an event stream. Frames follow the
//! WHATWG event-stream format: `field: value` lines, an empty line
//! terminates the event, `:` lines are comments.

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `id:` field, if present
    pub id: Option<String>,
    /// `event:` field; absent means the default `message`
    pub event: Option<String>,
    /// Concatenated `data:` lines, newline-joined
    pub data: String,
}

impl SseEvent {
    /// Event name, defaulting to `message`.
    #[must_use]
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Streaming decoder; feed it byte chunks, collect completed events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    current_id: Option<String>,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / heartbeat
            }

            let (field, value) = match line.find(':') {
                Some(idx) => {
                    let value = &line[idx + 1..];
                    (line[..idx].to_string(), value.strip_prefix(' ').unwrap_or(value).to_string())
                }
                None => (line, String::new()),
            };
            match field.as_str() {
                "id" => self.current_id = Some(value),
                "event" => self.current_event = Some(value),
                "data" => self.current_data.push(value),
                _ => {} // retry and unknown fields are ignored
            }
        }
        events
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_id.is_none() && self.current_event.is_none() && self.current_data.is_empty()
        {
            return None;
        }
        Some(SseEvent {
            id: self.current_id.take(),
            event: self.current_event.take(),
            data: std::mem::take(&mut self.current_data).join("\n"),
        })
    }
}
