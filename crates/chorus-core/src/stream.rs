use crate::ids::ToolCallId;

/// Events produced while parsing one streamed chat completion.
///
/// Ordering contract for a successful stream:
///
/// (TextDelta | ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Finish? → Done
///
/// `ToolCallEnd` is inferred, never sent on the wire: it fires when content
/// resumes, on `finish_reason`, or when the stream ends.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta { delta: String },

    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_call_id: ToolCallId, name: String, arguments: String },

    Finish { reason: String },
    Done,
}

/// A raw server-sent event, already split from the byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseFrame {
    /// The payload of one `data:` event.
    Data(String),
    /// The literal `data: [DONE]` terminator.
    Done,
}

impl SseFrame {
    pub fn from_payload(payload: &str) -> Self {
        if payload.trim() == "[DONE]" {
            Self::Done
        } else {
            Self::Data(payload.to_string())
        }
    }
}
