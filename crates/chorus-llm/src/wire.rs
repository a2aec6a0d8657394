use serde::{Deserialize, Serialize};

use chorus_core::identity::AgentIdentity;
use chorus_core::messages::{ChatMessage, ConversationHistory};

/// Body of `POST {endpoint}/chat/completions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Streamed completion over the full history.
    pub fn streaming(identity: &AgentIdentity, history: &ConversationHistory) -> Self {
        Self {
            model: identity.model.clone(),
            messages: history.messages().to_vec(),
            stream: true,
            max_tokens: None,
        }
    }

    /// Minimal non-streamed request used as a reachability check.
    pub fn probe(identity: &AgentIdentity) -> Self {
        Self {
            model: identity.model.clone(),
            messages: vec![ChatMessage::user("ping")],
            stream: false,
            max_tokens: Some(1),
        }
    }
}

// --- Streamed chunk shapes ---

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ToolCallFragment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub function: Option<FunctionFragment>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FunctionFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn streaming_request_body() {
        let identity = AgentIdentity::new("alice", "http://a").with_model("gpt-4o-mini");
        let mut history = ConversationHistory::new(Some("be brief"));
        history.push_user("hi");
        let body = serde_json::to_value(ChatRequest::streaming(&identity, &history)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn probe_request_is_minimal() {
        let identity = AgentIdentity::new("alice", "http://a");
        let body = serde_json::to_value(ChatRequest::probe(&identity)).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 1);
        assert!(body.get("model").is_none());
    }

    #[test]
    fn chunk_tolerates_missing_fields() {
        let chunk: ChatChunk = serde_json::from_str(r#"{"id":"x","choices":[{"index":0}]}"#).unwrap();
        assert!(chunk.choices[0].delta.is_none());

        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"{}"}}]}}]}"#,
        )
        .unwrap();
        let calls = chunk.choices[0].delta.as_ref().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, Some(1));
        assert!(calls[0].id.is_none());
    }
}
