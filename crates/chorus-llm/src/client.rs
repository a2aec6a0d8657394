use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use chorus_core::errors::ClientError;
use chorus_core::events::ChatEvent;
use chorus_core::identity::AgentIdentity;
use chorus_core::messages::ConversationHistory;
use chorus_core::sink::EventSink;
use chorus_core::stream::{SseFrame, StreamEvent};

use crate::sse::ChunkParser;
use crate::transport::ChatTransport;
use crate::wire::ChatRequest;

/// One agent's streaming chat-completion client.
///
/// Owns the agent's [`ConversationHistory`]. The history lock is held for the
/// whole of a `send`, so concurrent sends to the same agent run one after
/// another and each sees the previous exchange.
pub struct StreamingClient {
    identity: Arc<AgentIdentity>,
    token: Option<SecretString>,
    transport: Arc<dyn ChatTransport>,
    history: Mutex<ConversationHistory>,
    request_timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl StreamingClient {
    pub fn new(
        identity: Arc<AgentIdentity>,
        token: Option<SecretString>,
        transport: Arc<dyn ChatTransport>,
        sink: Arc<dyn EventSink>,
        request_timeout: Duration,
    ) -> Self {
        let history = ConversationHistory::new(identity.system_prompt.as_deref());
        Self {
            identity,
            token,
            transport,
            history: Mutex::new(history),
            request_timeout,
            sink,
        }
    }

    pub fn identity(&self) -> &Arc<AgentIdentity> {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Reachability check. Returns the HTTP status; the caller decides what
    /// counts as reachable.
    pub async fn probe(&self) -> Result<u16, ClientError> {
        let request = ChatRequest::probe(&self.identity);
        self.transport
            .probe(&self.identity, self.token.as_ref(), &request)
            .await
    }

    /// Request body for a streamed completion over `history`.
    pub fn build_request(&self, history: &ConversationHistory) -> ChatRequest {
        ChatRequest::streaming(&self.identity, history)
    }

    pub async fn history(&self) -> ConversationHistory {
        self.history.lock().await.clone()
    }

    /// Replace the history wholesale, e.g. when resuming a saved session.
    pub async fn restore(&self, history: ConversationHistory) {
        *self.history.lock().await = history;
    }

    /// Send `message` and stream the reply.
    ///
    /// Returns `Err` only when no text at all was received. A failure after
    /// partial text still returns `Ok(partial)`; the `error` event is emitted
    /// either way.
    #[instrument(skip_all, fields(agent = %self.identity.name))]
    pub async fn send(&self, message: &str) -> Result<String, ClientError> {
        let mut history = self.history.lock().await;
        history.push_user(message);
        let request = self.build_request(&history);

        self.sink.emit(ChatEvent::Thinking {
            agent: self.identity.name.clone(),
        });

        let mut parser = ChunkParser::new();
        let mut reply = String::new();
        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.stream_reply(&request, &mut parser, &mut reply),
        )
        .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                self.forward(parser.finish(), &mut reply);
                Some(ClientError::Timeout(self.request_timeout))
            }
        };

        if !reply.is_empty() {
            history.push_assistant(reply.clone());
        }
        drop(history);

        match failure {
            None => {
                debug!(chars = reply.len(), "reply complete");
                self.sink.emit(ChatEvent::Done {
                    agent: self.identity.name.clone(),
                    text: reply.clone(),
                });
                Ok(reply)
            }
            Some(error) => {
                warn!(error = %error, kind = error.error_kind(), partial = reply.len(), "send failed");
                self.sink.emit(ChatEvent::Error {
                    agent: self.identity.name.clone(),
                    error: error.to_string(),
                });
                if reply.is_empty() {
                    Err(error)
                } else {
                    Ok(reply)
                }
            }
        }
    }

    async fn stream_reply(
        &self,
        request: &ChatRequest,
        parser: &mut ChunkParser,
        reply: &mut String,
    ) -> Result<(), ClientError> {
        let mut frames = self
            .transport
            .stream(&self.identity, self.token.as_ref(), request)
            .await?;

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.forward(parser.finish(), reply);
                    return Err(e);
                }
            };
            let done = frame == SseFrame::Done;
            self.forward(parser.push_frame(&frame), reply);
            if done {
                return Ok(());
            }
        }

        self.forward(parser.finish(), reply);
        if parser.is_complete() {
            Ok(())
        } else {
            Err(ClientError::StreamInterrupted("stream ended before [DONE]".into()))
        }
    }

    fn forward(&self, events: Vec<StreamEvent>, reply: &mut String) {
        let agent = &self.identity.name;
        for event in events {
            match event {
                StreamEvent::TextDelta { delta } => {
                    reply.push_str(&delta);
                    self.sink.emit(ChatEvent::Delta {
                        agent: agent.clone(),
                        text: delta,
                    });
                }
                StreamEvent::ToolCallStart { tool_call_id, name } => {
                    debug!(tool_call_id = %tool_call_id, name = %name, "tool call started");
                    self.sink.emit(ChatEvent::ToolStart {
                        agent: agent.clone(),
                        tool_call_id,
                        name,
                    });
                }
                StreamEvent::ToolCallEnd { tool_call_id, name, .. } => {
                    self.sink.emit(ChatEvent::ToolEnd {
                        agent: agent.clone(),
                        tool_call_id,
                        name,
                    });
                }
                StreamEvent::Finish { reason } => debug!(reason = %reason, "finish"),
                StreamEvent::ToolCallDelta { .. } | StreamEvent::Done => {}
            }
        }
    }
}
