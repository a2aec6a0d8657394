use tracing::debug;

use chorus_core::ids::ToolCallId;
use chorus_core::stream::{SseFrame, StreamEvent};

use crate::wire::{ChatChunk, ToolCallFragment};

/// Parse raw SSE text into data frames.
///
/// Multi-line `data:` fields are joined with `\n`; comment lines and other
/// fields are ignored; events without data are dropped.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !data.is_empty() {
                frames.push(SseFrame::from_payload(&data.join("\n")));
                data.clear();
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    // Trailing event without blank line
    if !data.is_empty() {
        frames.push(SseFrame::from_payload(&data.join("\n")));
    }

    frames
}

/// Drain every complete event (terminated by a blank line) from `buffer`.
///
/// The buffer holds raw bytes so a UTF-8 sequence split across network
/// chunks stays intact until its event is complete.
pub fn drain_frames(buffer: &mut Vec<u8>) -> Vec<SseFrame> {
    if buffer.contains(&b'\r') {
        strip_crlf(buffer);
    }
    let Some(pos) = buffer.windows(2).rposition(|w| w == b"\n\n") else {
        return Vec::new();
    };
    let complete: Vec<u8> = buffer.drain(..pos + 2).collect();
    parse_sse_lines(&String::from_utf8_lossy(&complete))
}

/// Collapse `\r\n` into `\n`; a trailing `\r` waits for the next chunk.
fn strip_crlf(buffer: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(buffer.len());
    let mut bytes = buffer.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    *buffer = out;
}

// --- Chunk parser ---

struct ToolCallState {
    id: ToolCallId,
    index: Option<u32>,
    name: String,
    arguments: String,
    open: bool,
}

/// State machine turning chat-completion chunks into [`StreamEvent`]s.
///
/// The wire format never says when a tool call ends, so the parser infers it:
/// a call starts the first time its id is seen, and every open call closes
/// (in the order it was opened) when content resumes, on `finish_reason`, on
/// `[DONE]`, or when the caller reports end of stream via [`ChunkParser::finish`].
#[derive(Default)]
pub struct ChunkParser {
    calls: Vec<ToolCallState>,
    text: String,
    finish_reason: Option<String>,
    done: bool,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full content received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Whether `[DONE]` or a `finish_reason` was seen.
    pub fn is_complete(&self) -> bool {
        self.done || self.finish_reason.is_some()
    }

    pub fn push_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match frame {
            SseFrame::Done => {
                self.close_open_calls(&mut events);
                self.done = true;
                events.push(StreamEvent::Done);
            }
            SseFrame::Data(payload) => self.push_data(payload, &mut events),
        }
        events
    }

    /// Force-close anything still open at end of stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.close_open_calls(&mut events);
        events
    }

    fn push_data(&mut self, payload: &str, events: &mut Vec<StreamEvent>) {
        let chunk: ChatChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping malformed frame");
                return;
            }
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.close_open_calls(events);
                self.text.push_str(&content);
                events.push(StreamEvent::TextDelta { delta: content });
            }
            for fragment in delta.tool_calls.unwrap_or_default() {
                self.push_tool_fragment(fragment, events);
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.close_open_calls(events);
            self.finish_reason = Some(reason.clone());
            events.push(StreamEvent::Finish { reason });
        }
    }

    fn push_tool_fragment(&mut self, fragment: ToolCallFragment, events: &mut Vec<StreamEvent>) {
        let (name, arguments) = fragment
            .function
            .map(|f| (f.name, f.arguments.unwrap_or_default()))
            .unwrap_or_default();

        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            match self.calls.iter().position(|c| c.id.as_str() == id) {
                Some(pos) => self.append(pos, name, &arguments, events),
                None => self.start(ToolCallId::from_raw(id), fragment.index, name, &arguments, events),
            }
            return;
        }

        let same_index = fragment
            .index
            .and_then(|idx| self.calls.iter().position(|c| c.open && c.index == Some(idx)));
        let target = same_index.or_else(|| self.calls.iter().rposition(|c| c.open));
        if let Some(pos) = target {
            self.append(pos, name, &arguments, events);
            return;
        }

        let closed = fragment
            .index
            .and_then(|idx| self.calls.iter().position(|c| c.index == Some(idx)));
        match closed {
            Some(pos) => self.append(pos, name, &arguments, events),
            None => {
                let idx = fragment.index.unwrap_or(0);
                let id = ToolCallId::from_raw(format!("call_{idx}"));
                self.start(id, fragment.index, name, &arguments, events);
            }
        }
    }

    fn start(
        &mut self,
        id: ToolCallId,
        index: Option<u32>,
        name: Option<String>,
        arguments: &str,
        events: &mut Vec<StreamEvent>,
    ) {
        let name = name.unwrap_or_default();
        events.push(StreamEvent::ToolCallStart {
            tool_call_id: id.clone(),
            name: name.clone(),
        });
        if !arguments.is_empty() {
            events.push(StreamEvent::ToolCallDelta {
                tool_call_id: id.clone(),
                arguments_delta: arguments.to_string(),
            });
        }
        self.calls.push(ToolCallState {
            id,
            index,
            name,
            arguments: arguments.to_string(),
            open: true,
        });
    }

    /// Closed calls absorb late fragments without emitting anything.
    fn append(
        &mut self,
        pos: usize,
        name: Option<String>,
        arguments: &str,
        events: &mut Vec<StreamEvent>,
    ) {
        let call = &mut self.calls[pos];
        if call.name.is_empty() {
            if let Some(name) = name {
                call.name = name;
            }
        }
        call.arguments.push_str(arguments);
        if call.open && !arguments.is_empty() {
            events.push(StreamEvent::ToolCallDelta {
                tool_call_id: call.id.clone(),
                arguments_delta: arguments.to_string(),
            });
        }
    }

    fn close_open_calls(&mut self, events: &mut Vec<StreamEvent>) {
        for call in self.calls.iter_mut().filter(|c| c.open) {
            call.open = false;
            events.push(StreamEvent::ToolCallEnd {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
    }
}
