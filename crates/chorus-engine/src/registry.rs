use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use chorus_core::config::SecretsProvider;
use chorus_core::errors::ClientError;
use chorus_core::events::ChatEvent;
use chorus_core::identity::{normalize_name, AgentDirectory};
use chorus_core::messages::ConversationHistory;
use chorus_core::sink::EventSink;
use chorus_llm::{ChatTransport, StreamingClient};

type PendingConnect = Shared<BoxFuture<'static, Option<Arc<StreamingClient>>>>;

/// Lazily connects agents and hands out their clients.
///
/// At most one connection attempt per agent name is in flight; callers that
/// arrive while it runs await the same result.
pub struct ConnectionRegistry {
    directory: Arc<AgentDirectory>,
    transport: Arc<dyn ChatTransport>,
    secrets: Arc<dyn SecretsProvider>,
    sink: Arc<dyn EventSink>,
    request_timeout: Duration,
    connect_timeout: Duration,
    connected: Arc<DashMap<String, Arc<StreamingClient>>>,
    pending: Arc<DashMap<String, PendingConnect>>,
    staged: Arc<DashMap<String, ConversationHistory>>,
}

impl ConnectionRegistry {
    pub fn new(
        directory: Arc<AgentDirectory>,
        transport: Arc<dyn ChatTransport>,
        secrets: Arc<dyn SecretsProvider>,
        sink: Arc<dyn EventSink>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            transport,
            secrets,
            sink,
            request_timeout,
            connect_timeout,
            connected: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            staged: Arc::new(DashMap::new()),
        }
    }

    /// Connected client for `name`, connecting first if needed.
    /// `None` if the agent is unknown or unreachable; nothing is retried.
    pub async fn ensure(&self, name: &str) -> Option<Arc<StreamingClient>> {
        let key = normalize_name(name);
        if let Some(client) = self.client(&key) {
            return Some(client);
        }

        let attempt = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(agent = %key, "joining in-flight connection attempt");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // The attempt may have finished between the first lookup and
                // taking the entry lock.
                if let Some(client) = self.client(&key) {
                    return Some(client);
                }
                let attempt = self.connect(key.clone()).boxed().shared();
                entry.insert(attempt.clone());
                attempt
            }
        };
        attempt.await
    }

    /// Connected client without connecting.
    pub fn client(&self, name: &str) -> Option<Arc<StreamingClient>> {
        self.connected
            .get(&normalize_name(name))
            .map(|c| Arc::clone(c.value()))
    }

    pub fn disconnect(&self, name: &str) -> bool {
        self.connected.remove(&normalize_name(name)).is_some()
    }

    /// Connected agent names, sorted.
    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connected.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// History to install into `name`'s client when it connects.
    pub fn stage_history(&self, name: &str, history: ConversationHistory) {
        let key = normalize_name(name);
        match self.client(&key) {
            Some(client) => {
                // Already connected: apply on the next scheduler tick.
                tokio::spawn(async move { client.restore(history).await });
            }
            None => {
                self.staged.insert(key, history);
            }
        }
    }

    fn connect(&self, name: String) -> impl std::future::Future<Output = Option<Arc<StreamingClient>>> {
        let identity = self.directory.get(&name);
        let transport = Arc::clone(&self.transport);
        let secrets = Arc::clone(&self.secrets);
        let sink = Arc::clone(&self.sink);
        let connected = Arc::clone(&self.connected);
        let pending = Arc::clone(&self.pending);
        let staged = Arc::clone(&self.staged);
        let request_timeout = self.request_timeout;
        let connect_timeout = self.connect_timeout;

        async move {
            let Some(identity) = identity else {
                warn!(agent = %name, "cannot connect unknown agent");
                sink.emit(ChatEvent::ConnectError {
                    agent: name.clone(),
                    error: format!("unknown agent: {name}"),
                });
                pending.remove(&name);
                return None;
            };

            sink.emit(ChatEvent::Connecting { agent: name.clone() });
            let token = secrets.bearer_token(&identity);
            let client = Arc::new(StreamingClient::new(
                identity,
                token,
                transport,
                Arc::clone(&sink),
                request_timeout,
            ));

            let outcome = match tokio::time::timeout(connect_timeout, client.probe()).await {
                Ok(Ok(status)) if status < 500 => Ok(status),
                Ok(Ok(status)) => Err(ClientError::from_status(status, String::new())),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClientError::Timeout(connect_timeout)),
            };

            let result = match outcome {
                Ok(status) => {
                    if let Some((_, history)) = staged.remove(&name) {
                        client.restore(history).await;
                    }
                    info!(agent = %name, status, "agent connected");
                    connected.insert(name.clone(), Arc::clone(&client));
                    sink.emit(ChatEvent::Connected { agent: name.clone() });
                    Some(client)
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "connection failed");
                    sink.emit(ChatEvent::ConnectError {
                        agent: name.clone(),
                        error: e.to_string(),
                    });
                    None
                }
            };
            pending.remove(&name);
            result
        }
    }
}
