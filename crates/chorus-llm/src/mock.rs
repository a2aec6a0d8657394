use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;

use chorus_core::errors::ClientError;
use chorus_core::identity::{normalize_name, AgentIdentity};
use chorus_core::messages::Role;
use chorus_core::stream::SseFrame;

use crate::transport::{ChatTransport, FrameStream};
use crate::wire::ChatRequest;

/// Pre-programmed reply for one streamed request.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Yield these frames, then end.
    Frames(Vec<SseFrame>),
    /// Fail the request itself.
    Fail(ClientError),
    /// Yield these frames, then fail mid-stream.
    Interrupt(Vec<SseFrame>, ClientError),
    /// Yield these frames, then never produce anything again.
    Stall(Vec<SseFrame>),
    /// Wait, then behave like the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// A complete reply consisting of one content chunk.
    pub fn text(text: &str) -> Self {
        Self::Frames(vec![content_frame(text), finish_frame("stop"), SseFrame::Done])
    }

    /// A complete reply streamed as several content chunks.
    pub fn chunks(parts: &[&str]) -> Self {
        let mut frames: Vec<SseFrame> = parts.iter().map(|p| content_frame(p)).collect();
        frames.push(finish_frame("stop"));
        frames.push(SseFrame::Done);
        Self::Frames(frames)
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// `data:` frame carrying a content delta.
pub fn content_frame(text: &str) -> SseFrame {
    SseFrame::Data(serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string())
}

/// `data:` frame carrying one tool-call fragment.
pub fn tool_frame(id: Option<&str>, index: u32, name: Option<&str>, arguments: &str) -> SseFrame {
    let mut call = serde_json::json!({"index": index, "function": {"arguments": arguments}});
    if let Some(id) = id {
        call["id"] = id.into();
        call["type"] = "function".into();
    }
    if let Some(name) = name {
        call["function"]["name"] = name.into();
    }
    SseFrame::Data(
        serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [call]}}]}).to_string(),
    )
}

/// `data:` frame carrying a `finish_reason`.
pub fn finish_frame(reason: &str) -> SseFrame {
    SseFrame::Data(
        serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}).to_string(),
    )
}

type Responder = Arc<dyn Fn(&ChatRequest) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    queued: HashMap<String, VecDeque<MockReply>>,
    responders: HashMap<String, Responder>,
    requests: HashMap<String, Vec<ChatRequest>>,
    probe_statuses: HashMap<String, u16>,
    unreachable: HashSet<String>,
    probe_counts: HashMap<String, usize>,
}

/// Scriptable transport for deterministic tests without a network.
///
/// Replies are looked up by agent name: queued replies first, then the
/// agent's responder closure. Probes succeed with 200 unless configured.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    probe_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply for the next streamed request to `agent`.
    pub fn push_reply(&self, agent: &str, reply: MockReply) -> &Self {
        self.state
            .lock()
            .queued
            .entry(normalize_name(agent))
            .or_default()
            .push_back(reply);
        self
    }

    /// Answer every otherwise-unscripted request to `agent` with `f`.
    pub fn respond_with<F>(&self, agent: &str, f: F) -> &Self
    where
        F: Fn(&ChatRequest) -> MockReply + Send + Sync + 'static,
    {
        self.state.lock().responders.insert(normalize_name(agent), Arc::new(f));
        self
    }

    pub fn set_probe_status(&self, agent: &str, status: u16) -> &Self {
        self.state.lock().probe_statuses.insert(normalize_name(agent), status);
        self
    }

    /// Make probes to `agent` fail with a connect error.
    pub fn set_unreachable(&self, agent: &str) -> &Self {
        self.state.lock().unreachable.insert(normalize_name(agent));
        self
    }

    pub fn set_probe_delay(&self, delay: Duration) -> &Self {
        *self.probe_delay.lock() = Some(delay);
        self
    }

    pub fn probe_count(&self, agent: &str) -> usize {
        self.state
            .lock()
            .probe_counts
            .get(&normalize_name(agent))
            .copied()
            .unwrap_or(0)
    }

    /// Streamed requests sent to `agent`, in order.
    pub fn requests(&self, agent: &str) -> Vec<ChatRequest> {
        self.state
            .lock()
            .requests
            .get(&normalize_name(agent))
            .cloned()
            .unwrap_or_default()
    }

    pub fn stream_count(&self, agent: &str) -> usize {
        self.state
            .lock()
            .requests
            .get(&normalize_name(agent))
            .map_or(0, Vec::len)
    }

    /// Total streamed requests across all agents.
    pub fn total_streams(&self) -> usize {
        self.state.lock().requests.values().map(Vec::len).sum()
    }

    fn next_reply(&self, agent: &str, request: &ChatRequest) -> MockReply {
        let responder = {
            let mut state = self.state.lock();
            state
                .requests
                .entry(agent.to_string())
                .or_default()
                .push(request.clone());
            if let Some(reply) = state.queued.get_mut(agent).and_then(VecDeque::pop_front) {
                return reply;
            }
            state.responders.get(agent).cloned()
        };
        match responder {
            Some(f) => f(request),
            None => MockReply::Fail(ClientError::Connect(format!(
                "no scripted reply for {agent}"
            ))),
        }
    }
}

/// Text of the last user message in a request.
pub fn last_user_message(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str())
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn probe(
        &self,
        identity: &AgentIdentity,
        _token: Option<&SecretString>,
        _request: &ChatRequest,
    ) -> Result<u16, ClientError> {
        let (status, unreachable) = {
            let mut state = self.state.lock();
            *state.probe_counts.entry(identity.name.clone()).or_default() += 1;
            (
                state.probe_statuses.get(&identity.name).copied().unwrap_or(200),
                state.unreachable.contains(&identity.name),
            )
        };
        let delay = *self.probe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(ClientError::Connect(format!("{} refused connection", identity.name)));
        }
        Ok(status)
    }

    async fn stream(
        &self,
        identity: &AgentIdentity,
        _token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<FrameStream, ClientError> {
        let mut reply = self.next_reply(&identity.name, request);
        loop {
            match reply {
                MockReply::Frames(frames) => {
                    return Ok(Box::pin(stream::iter(frames.into_iter().map(Ok::<_, ClientError>))));
                }
                MockReply::Fail(error) => return Err(error),
                MockReply::Interrupt(frames, error) => {
                    let items = frames.into_iter().map(Ok).chain(std::iter::once(Err(error)));
                    return Ok(Box::pin(stream::iter(items)));
                }
                MockReply::Stall(frames) => {
                    let items =
                        stream::iter(frames.into_iter().map(Ok::<_, ClientError>)).chain(stream::pending());
                    return Ok(Box::pin(items));
                }
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }
}
