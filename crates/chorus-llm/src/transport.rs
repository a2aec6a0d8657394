use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use chorus_core::errors::ClientError;
use chorus_core::identity::AgentIdentity;
use chorus_core::stream::SseFrame;

use crate::sse;
use crate::wire::ChatRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, ClientError>> + Send>>;

/// The seam between a [`crate::StreamingClient`] and the wire.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue a non-streamed request and return the HTTP status, whatever it is.
    async fn probe(
        &self,
        identity: &AgentIdentity,
        token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<u16, ClientError>;

    /// Issue a streamed request and return its SSE frames.
    async fn stream(
        &self,
        identity: &AgentIdentity,
        token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<FrameStream, ClientError>;
}

/// OpenAI-compatible chat-completions over reqwest.
pub struct HttpTransport {
    client: Client,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self, ClientError> {
        Self::with_idle_timeout(SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Self { client, idle_timeout })
    }

    fn post(
        &self,
        identity: &AgentIdentity,
        token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.post(identity.completions_url());
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        req.header("content-type", "application/json").json(request)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    #[instrument(skip_all, fields(agent = %identity.name))]
    async fn probe(
        &self,
        identity: &AgentIdentity,
        token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<u16, ClientError> {
        let resp = self
            .post(identity, token, request)
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(resp.status().as_u16())
    }

    #[instrument(skip_all, fields(agent = %identity.name))]
    async fn stream(
        &self,
        identity: &AgentIdentity,
        token: Option<&SecretString>,
        request: &ChatRequest,
    ) -> Result<FrameStream, ClientError> {
        let resp = self
            .post(identity, token, request)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, body));
        }

        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.idle_timeout,
        )))
    }
}

/// Wraps a byte stream from reqwest and yields SSE frames.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<SseFrame>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn fail(&mut self, error: ClientError) -> Poll<Option<Result<SseFrame, ClientError>>> {
        self.finished = true;
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for SseStream {
    type Item = Result<SseFrame, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.pending.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.buffer.extend_from_slice(&bytes);
                    let frames = sse::drain_frames(&mut self.buffer);
                    self.pending.extend(frames);

                    if let Some(frame) = self.pending.pop_front() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.fail(ClientError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let remaining = std::mem::take(&mut self.buffer);
                    self.pending
                        .extend(sse::parse_sse_lines(&String::from_utf8_lossy(&remaining)));
                    return Poll::Ready(self.pending.pop_front().map(Ok));
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        return self.fail(ClientError::StreamInterrupted(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
