//! Turn orchestration: coordinator reply, recursive `@mention` fan-out,
//! fold-back synthesis, and the depth, budget and round limits that keep the
//! fan-out bounded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn, Instrument};

use chorus_core::config::{ConfigProvider, SecretsProvider, SwarmConfig, VocabularyMode};
use chorus_core::errors::ClientError;
use chorus_core::events::{AgentResult, ChatEvent};
use chorus_core::identity::{AgentDirectory, AgentIdentity};
use chorus_core::ids::TurnId;
use chorus_core::sink::EventSink;
use chorus_llm::{ChatTransport, StreamingClient};

use crate::aggregator::{in_cohort, CohortId, CohortTracker};
use crate::error::EngineError;
use crate::mentions::{Mention, MentionExtractor};
use crate::registry::ConnectionRegistry;
use crate::spawn::AgentFactory;

/// Per-branch routing state, threaded explicitly through every recursive call.
#[derive(Clone, Debug)]
pub struct RoutingContext {
    pub depth: u32,
    /// Agents on this branch's lineage. Cloned per child, never shared
    /// between siblings.
    pub visited: HashSet<String>,
    pub parent: Option<String>,
    /// Dispatches made so far in the whole turn.
    pub dispatched: Arc<AtomicUsize>,
}

impl RoutingContext {
    pub fn root() -> Self {
        Self {
            depth: 0,
            visited: HashSet::new(),
            parent: None,
            dispatched: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Context for children dispatched by `agent`.
    pub fn child(&self, agent: &str) -> Self {
        let mut visited = self.visited.clone();
        visited.insert(agent.to_string());
        Self {
            depth: self.depth + 1,
            visited,
            parent: Some(agent.to_string()),
            dispatched: Arc::clone(&self.dispatched),
        }
    }

    pub fn dispatches(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub reply: String,
    /// Mention dispatches the turn used.
    pub dispatches: usize,
}

pub struct Router {
    config: SwarmConfig,
    directory: Arc<AgentDirectory>,
    registry: ConnectionRegistry,
    tracker: Arc<CohortTracker>,
    factory: AgentFactory,
    config_provider: Option<Arc<dyn ConfigProvider>>,
    persist_lock: Arc<Mutex<()>>,
}

impl Router {
    pub fn new(
        config: SwarmConfig,
        directory: Arc<AgentDirectory>,
        transport: Arc<dyn ChatTransport>,
        secrets: Arc<dyn SecretsProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let tracker = Arc::new(CohortTracker::new(sink));
        let registry = ConnectionRegistry::new(
            Arc::clone(&directory),
            transport,
            secrets,
            Arc::clone(&tracker) as Arc<dyn EventSink>,
            config.request_timeout,
            config.connect_timeout,
        );
        let factory = AgentFactory::new(directory.len());
        Self {
            config,
            directory,
            registry,
            tracker,
            factory,
            config_provider: None,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persist provisioned agents through `provider`.
    pub fn with_config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider = Some(provider);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Run one user turn. Exactly one `end` event is emitted, whatever the
    /// outcome.
    #[instrument(skip_all, fields(turn_id = tracing::field::Empty))]
    pub async fn turn(&self, text: &str) -> Result<TurnOutcome, EngineError> {
        let turn_id = TurnId::new();
        tracing::Span::current().record("turn_id", turn_id.as_str());
        let coordinator = self.directory.coordinator().to_string();

        let Some(client) = self.registry.ensure(&coordinator).await else {
            let error = EngineError::CoordinatorUnavailable(coordinator.clone());
            warn!(agent = %coordinator, "coordinator unavailable, ending turn");
            self.tracker.emit(ChatEvent::Error {
                agent: coordinator,
                error: error.to_string(),
            });
            self.tracker.emit(ChatEvent::End {
                turn_id,
                reply: None,
                error: Some(error.to_string()),
            });
            return Err(error);
        };

        let ctx = RoutingContext::root();
        match self.branch(client, text.to_string(), ctx.clone()).await {
            Ok(reply) => {
                info!(dispatches = ctx.dispatches(), "turn complete");
                self.tracker.emit(ChatEvent::End {
                    turn_id: turn_id.clone(),
                    reply: Some(reply.clone()),
                    error: None,
                });
                Ok(TurnOutcome {
                    turn_id,
                    reply,
                    dispatches: ctx.dispatches(),
                })
            }
            Err(e) => {
                self.tracker.emit(ChatEvent::End {
                    turn_id,
                    reply: None,
                    error: Some(e.to_string()),
                });
                Err(EngineError::Client(e))
            }
        }
    }

    /// Send `message` to `client`, then keep dispatching the reply's mentions
    /// and folding their results back until the reply is final.
    fn branch(
        &self,
        client: Arc<StreamingClient>,
        message: String,
        ctx: RoutingContext,
    ) -> BoxFuture<'_, Result<String, ClientError>> {
        let span = tracing::debug_span!("branch", agent = %client.name(), depth = ctx.depth);
        async move {
            let name = client.name().to_string();
            let mut reply = client.send(&message).await?;

            let mut exclude = ctx.visited.clone();
            exclude.insert(name.clone());
            let mut rounds = 0;

            loop {
                let mentions = self.extractor().extract(&reply, &exclude);
                if mentions.is_empty() {
                    break;
                }
                if ctx.depth >= self.config.max_mention_depth {
                    info!(depth = ctx.depth, "mention depth limit reached");
                    break;
                }
                if rounds >= self.config.max_synthesis_rounds {
                    info!(rounds, "synthesis round limit reached");
                    break;
                }
                let mentions = self.resolve(mentions);
                if mentions.is_empty() {
                    break;
                }
                let requested = mentions.len();
                if !self.reserve(&ctx, requested) {
                    info!(requested, used = ctx.dispatches(), "mention budget exhausted");
                    break;
                }
                let mentions = self.provision_new(mentions);
                if mentions.len() < requested {
                    self.release(&ctx, requested - mentions.len());
                }
                if mentions.is_empty() {
                    break;
                }

                let results = self.dispatch(&name, mentions, ctx.child(&name)).await;
                rounds += 1;

                let follow_up = fold_back(&results);
                match client.send(&follow_up).await {
                    Ok(next) => reply = next,
                    Err(e) => {
                        warn!(error = %e, "synthesis failed, keeping previous reply");
                        break;
                    }
                }
            }
            Ok(reply)
        }
        .instrument(span)
        .boxed()
    }

    /// Run one child per mention concurrently and wait for all of them.
    async fn dispatch(
        &self,
        from: &str,
        mentions: Vec<Mention>,
        ctx: RoutingContext,
    ) -> Vec<AgentResult> {
        let agents: Vec<String> = mentions.iter().map(|m| m.target.clone()).collect();
        debug!(from, ?agents, depth = ctx.depth, "dispatching");

        let cohort = self.tracker.open(from, agents.clone());
        self.tracker.emit(ChatEvent::ParallelStart {
            from: from.to_string(),
            agents,
            depth: ctx.depth,
        });

        let children = mentions
            .into_iter()
            .map(|mention| self.run_child(from, mention, ctx.clone(), cohort));
        join_all(children).await;

        let results = self.tracker.close(cohort);
        self.tracker.emit(ChatEvent::ParallelEnd {
            from: from.to_string(),
            results: results.clone(),
        });
        results
    }

    async fn run_child(&self, from: &str, mention: Mention, ctx: RoutingContext, cohort: CohortId) {
        let to = mention.target;
        let depth = ctx.depth;
        self.tracker.emit(ChatEvent::ThreadStart {
            from: from.to_string(),
            to: to.clone(),
            depth,
            message: mention.message.clone(),
        });

        let message = mention.message;
        let outcome = in_cohort(cohort, async {
            match self.registry.ensure(&to).await {
                Some(client) => self
                    .branch(client, message, ctx)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err(format!("could not connect to {to}")),
            }
        })
        .await;

        self.tracker.emit(ChatEvent::ThreadEnd {
            from: from.to_string(),
            to: to.clone(),
            depth,
            ok: outcome.is_ok(),
        });
        if let Some(progress) = self.tracker.complete(cohort, &to, outcome) {
            self.tracker.emit(ChatEvent::ParallelProgress {
                from: from.to_string(),
                agent: to,
                status: progress.status,
                completed: progress.completed,
                total: progress.total,
            });
        }
    }

    fn extractor(&self) -> MentionExtractor {
        MentionExtractor::new(self.config.vocabulary, self.directory.names())
    }

    /// Keep mentions the router can dispatch: known agents, plus unknown
    /// names in open mode. Nothing is provisioned here.
    fn resolve(&self, mentions: Vec<Mention>) -> Vec<Mention> {
        mentions
            .into_iter()
            .filter(|m| {
                if self.directory.contains(&m.target) {
                    return true;
                }
                match self.config.vocabulary {
                    VocabularyMode::Closed => {
                        debug!(agent = %m.target, "dropping mention of unknown agent");
                        false
                    }
                    VocabularyMode::Open => true,
                }
            })
            .collect()
    }

    /// Provision every mentioned agent not yet in the directory, then persist
    /// the roster once. Mentions that could not be provisioned are dropped.
    fn provision_new(&self, mentions: Vec<Mention>) -> Vec<Mention> {
        let mut spawned = false;
        let kept = mentions
            .into_iter()
            .filter(|m| {
                if self.directory.contains(&m.target) {
                    return true;
                }
                match self.provision(&m.target) {
                    Some(inserted) => {
                        spawned |= inserted;
                        true
                    }
                    None => false,
                }
            })
            .collect();
        if spawned {
            self.persist_directory();
        }
        kept
    }

    /// Returns whether this call inserted the agent.
    fn provision(&self, name: &str) -> Option<bool> {
        let Some(coordinator) = self.directory.get(self.directory.coordinator()) else {
            debug!(agent = name, "no coordinator identity to provision from");
            return None;
        };
        let roster = self.directory.roster();
        let identity = self.factory.provision(name, &coordinator, &roster);
        let (identity, inserted) = self.directory.insert_if_absent(identity);
        if inserted {
            info!(agent = %identity.name, color = ?identity.color, "provisioned agent");
            self.tracker.emit(ChatEvent::AgentSpawned {
                agent: identity.name.clone(),
                label: identity.label.clone(),
                color: identity.color.clone(),
            });
        }
        Some(inserted)
    }

    /// Save the roster in the background; failures are only logged.
    ///
    /// Saves run one at a time and each snapshots the directory when it
    /// starts, so the last save to finish holds every agent inserted so far.
    fn persist_directory(&self) {
        let Some(provider) = self.config_provider.clone() else {
            return;
        };
        let directory = Arc::clone(&self.directory);
        let lock = Arc::clone(&self.persist_lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let agents: Vec<AgentIdentity> =
                directory.roster().iter().map(|a| a.as_ref().clone()).collect();
            if let Err(e) = provider.save_agents(&agents) {
                warn!(error = %e, "failed to persist provisioned agents");
            }
        });
    }

    /// Reserve `n` dispatches against the turn's cap, all or nothing.
    fn reserve(&self, ctx: &RoutingContext, n: usize) -> bool {
        let cap = self.config.mention_cap;
        ctx.dispatched
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let total = used + n;
                cap.allows(total).then_some(total)
            })
            .is_ok()
    }

    fn release(&self, ctx: &RoutingContext, n: usize) {
        ctx.dispatched.fetch_sub(n, Ordering::SeqCst);
    }
}

/// Follow-up message carrying the children's replies back to their parent.
///
/// Children that failed without any text are left out, unless every child
/// failed, in which case the failures are reported so the parent can still
/// answer.
pub fn fold_back(results: &[AgentResult]) -> String {
    let replies: Vec<String> = results
        .iter()
        .filter_map(|r| r.text.as_ref().map(|text| format!("{} replied: {text}", r.agent)))
        .collect();
    if !replies.is_empty() {
        return replies.join("\n");
    }
    results
        .iter()
        .map(|r| {
            let error = r.error.as_deref().unwrap_or("no reply");
            format!("{} did not reply: {error}", r.agent)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::config::{MentionCap, StaticSecrets};
    use chorus_core::events::AgentStatus;
    use chorus_core::sink::NullSink;
    use chorus_llm::MockTransport;

    fn result(agent: &str, text: Option<&str>, error: Option<&str>) -> AgentResult {
        AgentResult {
            agent: agent.into(),
            status: if text.is_some() { AgentStatus::Done } else { AgentStatus::Error },
            text: text.map(Into::into),
            error: error.map(Into::into),
        }
    }

    fn router(cap: MentionCap) -> Router {
        let config = SwarmConfig {
            mention_cap: cap,
            ..SwarmConfig::default()
        };
        let directory = Arc::new(AgentDirectory::new(
            "master",
            [AgentIdentity::new("master", "http://m")],
        ));
        Router::new(
            config,
            directory,
            Arc::new(MockTransport::new()),
            Arc::new(StaticSecrets::default()),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn child_context_clones_visited() {
        let root = RoutingContext::root();
        let a = root.child("master");
        let b = a.child("alice");
        let sibling = a.child("bob");

        assert_eq!(b.depth, 2);
        assert!(b.visited.contains("master") && b.visited.contains("alice"));
        assert!(!sibling.visited.contains("alice"));
        assert_eq!(sibling.parent.as_deref(), Some("bob"));
        assert!(Arc::ptr_eq(&root.dispatched, &b.dispatched));
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let router = router(MentionCap::Limited(3));
        let ctx = RoutingContext::root();
        assert!(router.reserve(&ctx, 2));
        assert!(!router.reserve(&ctx, 2));
        assert_eq!(ctx.dispatches(), 2);
        assert!(router.reserve(&ctx, 1));
        assert!(!router.reserve(&ctx, 1));
    }

    #[test]
    fn unlimited_cap_always_reserves() {
        let router = router(MentionCap::Unlimited);
        let ctx = RoutingContext::root();
        assert!(router.reserve(&ctx, 1_000));
        assert!(router.reserve(&ctx, 1_000));
        assert_eq!(ctx.dispatches(), 2_000);
    }

    #[test]
    fn fold_back_skips_failed_children() {
        let results = vec![
            result("alice", Some("found it"), None),
            result("bob", None, Some("timeout")),
            result("carol", Some("partial"), Some("stream interrupted")),
        ];
        assert_eq!(
            fold_back(&results),
            "alice replied: found it\ncarol replied: partial"
        );
    }

    #[test]
    fn fold_back_reports_when_all_failed() {
        let results = vec![result("bob", None, Some("timeout"))];
        assert_eq!(fold_back(&results), "bob did not reply: timeout");
    }

    #[test]
    fn resolve_does_not_provision() {
        let mut router = router(MentionCap::Limited(10));
        router.config.vocabulary = VocabularyMode::Open;
        let kept = router.resolve(vec![Mention {
            target: "analyst".into(),
            message: "hi".into(),
        }]);
        assert_eq!(kept.len(), 1);
        assert!(!router.directory().contains("analyst"));

        let kept = router.provision_new(kept);
        assert_eq!(kept.len(), 1);
        assert!(router.directory().contains("analyst"));
    }

    #[test]
    fn resolve_drops_unknown_in_closed_mode() {
        let router = router(MentionCap::Limited(10));
        let kept = router.resolve(vec![Mention {
            target: "ghost".into(),
            message: "hi".into(),
        }]);
        assert!(kept.is_empty());
        assert!(!router.directory().contains("ghost"));
    }
}
