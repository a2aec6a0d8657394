use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use chorus_core::events::{AgentResult, AgentStatus, ChatEvent};
use chorus_core::sink::EventSink;

struct Entry {
    agent: String,
    status: AgentStatus,
    text: Option<String>,
    error: Option<String>,
}

/// Status and outcome of every agent in one cohort of parallel calls,
/// kept in dispatch order so the cohort can be presented deterministically
/// once it is resolved.
pub struct ResponseAggregator {
    from: String,
    entries: Vec<Entry>,
}

impl ResponseAggregator {
    pub fn new(from: impl Into<String>, agents: impl IntoIterator<Item = String>) -> Self {
        Self {
            from: from.into(),
            entries: agents
                .into_iter()
                .map(|agent| Entry {
                    agent,
                    status: AgentStatus::Idle,
                    text: None,
                    error: None,
                })
                .collect(),
        }
    }

    /// Agent that dispatched this cohort.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Apply a streamed lifecycle event. Returns the new status if it changed.
    pub fn observe(&mut self, event: &ChatEvent) -> Option<AgentStatus> {
        let (agent, status) = match event {
            ChatEvent::Thinking { agent } => (agent, AgentStatus::Thinking),
            ChatEvent::ToolStart { agent, .. } => (agent, AgentStatus::ToolUse),
            ChatEvent::ToolEnd { agent, .. } => (agent, AgentStatus::Thinking),
            ChatEvent::Delta { agent, .. } => (agent, AgentStatus::Streaming),
            _ => return None,
        };
        let entry = self.entries.iter_mut().find(|e| &e.agent == agent)?;
        if entry.status.is_finished() || entry.status == status {
            return None;
        }
        entry.status = status;
        Some(status)
    }

    /// Record a finished branch. Returns the agent's final status.
    pub fn complete(&mut self, agent: &str, outcome: Result<String, String>) -> Option<AgentStatus> {
        let entry = self.entries.iter_mut().find(|e| e.agent == agent)?;
        match outcome {
            Ok(text) => {
                entry.status = AgentStatus::Done;
                entry.text = Some(text);
            }
            Err(error) => {
                entry.status = AgentStatus::Error;
                entry.error = Some(error);
            }
        }
        Some(entry.status)
    }

    pub fn status(&self, agent: &str) -> Option<AgentStatus> {
        self.entries.iter().find(|e| e.agent == agent).map(|e| e.status)
    }

    pub fn completed(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_finished()).count()
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn is_resolved(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_finished())
    }

    /// Results in dispatch order.
    pub fn results(&self) -> Vec<AgentResult> {
        self.entries
            .iter()
            .map(|e| AgentResult {
                agent: e.agent.clone(),
                status: e.status,
                text: e.text.clone(),
                error: e.error.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CohortId(u64);

/// Progress after one member of a cohort finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CohortProgress {
    pub status: AgentStatus,
    pub completed: usize,
    pub total: usize,
}

tokio::task_local! {
    /// Cohort whose member the current child future is running.
    static ACTIVE_COHORT: CohortId;
}

/// Run `fut` as a member of `cohort`: lifecycle events emitted while it is
/// polled update that cohort only.
pub async fn in_cohort<F: Future>(cohort: CohortId, fut: F) -> F::Output {
    ACTIVE_COHORT.scope(cohort, fut).await
}

/// [`EventSink`] decorator that forwards every event and keeps the live
/// cohorts' statuses in step with the streamed lifecycle events.
///
/// An event updates only the cohort of the child future that emitted it, so
/// two cohorts waiting on the same agent do not see each other's streams.
pub struct CohortTracker {
    inner: Arc<dyn EventSink>,
    cohorts: Mutex<HashMap<CohortId, ResponseAggregator>>,
    next_id: AtomicU64,
}

impl CohortTracker {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            cohorts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn open(&self, from: &str, agents: Vec<String>) -> CohortId {
        let id = CohortId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.cohorts.lock().insert(id, ResponseAggregator::new(from, agents));
        id
    }

    pub fn complete(
        &self,
        cohort: CohortId,
        agent: &str,
        outcome: Result<String, String>,
    ) -> Option<CohortProgress> {
        let mut cohorts = self.cohorts.lock();
        let aggregator = cohorts.get_mut(&cohort)?;
        let status = aggregator.complete(agent, outcome)?;
        Some(CohortProgress {
            status,
            completed: aggregator.completed(),
            total: aggregator.total(),
        })
    }

    pub fn status(&self, cohort: CohortId, agent: &str) -> Option<AgentStatus> {
        self.cohorts.lock().get(&cohort)?.status(agent)
    }

    /// Remove the cohort and return its results in dispatch order.
    pub fn close(&self, cohort: CohortId) -> Vec<AgentResult> {
        self.cohorts
            .lock()
            .remove(&cohort)
            .map(|a| a.results())
            .unwrap_or_default()
    }

    pub fn open_cohorts(&self) -> usize {
        self.cohorts.lock().len()
    }
}

impl EventSink for CohortTracker {
    fn emit(&self, event: ChatEvent) {
        if let Ok(cohort) = ACTIVE_COHORT.try_with(|c| *c) {
            if let Some(aggregator) = self.cohorts.lock().get_mut(&cohort) {
                aggregator.observe(&event);
            }
        }
        self.inner.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::ids::ToolCallId;
    use chorus_core::sink::NullSink;

    fn agents(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn observe_maps_lifecycle_events() {
        let mut agg = ResponseAggregator::new("master", agents(&["alice"]));
        let thinking = ChatEvent::Thinking { agent: "alice".into() };
        let tool_start = ChatEvent::ToolStart {
            agent: "alice".into(),
            tool_call_id: ToolCallId::from_raw("c1"),
            name: "search".into(),
        };
        let tool_end = ChatEvent::ToolEnd {
            agent: "alice".into(),
            tool_call_id: ToolCallId::from_raw("c1"),
            name: "search".into(),
        };
        let delta = ChatEvent::Delta { agent: "alice".into(), text: "x".into() };

        assert_eq!(agg.observe(&thinking), Some(AgentStatus::Thinking));
        assert_eq!(agg.observe(&tool_start), Some(AgentStatus::ToolUse));
        assert_eq!(agg.observe(&tool_end), Some(AgentStatus::Thinking));
        assert_eq!(agg.observe(&delta), Some(AgentStatus::Streaming));
        assert_eq!(agg.observe(&delta), None);
    }

    #[test]
    fn observe_ignores_other_agents_and_finished_entries() {
        let mut agg = ResponseAggregator::new("master", agents(&["alice"]));
        assert_eq!(agg.observe(&ChatEvent::Thinking { agent: "bob".into() }), None);

        agg.complete("alice", Ok("done".into()));
        assert_eq!(agg.observe(&ChatEvent::Thinking { agent: "alice".into() }), None);
        assert_eq!(agg.status("alice"), Some(AgentStatus::Done));
    }

    #[test]
    fn results_keep_dispatch_order() {
        let mut agg = ResponseAggregator::new("master", agents(&["alice", "bob", "carol"]));
        agg.complete("carol", Ok("c".into()));
        agg.complete("alice", Err("refused".into()));
        assert!(!agg.is_resolved());
        assert_eq!(agg.completed(), 2);
        agg.complete("bob", Ok("b".into()));
        assert!(agg.is_resolved());

        let results = agg.results();
        let order: Vec<_> = results.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob", "carol"]);
        assert_eq!(results[0].status, AgentStatus::Error);
        assert_eq!(results[0].error.as_deref(), Some("refused"));
        assert_eq!(results[2].text.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn tracker_feeds_active_cohort_and_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = CohortTracker::new(Arc::new(tx));
        let cohort = tracker.open("master", agents(&["alice", "bob"]));

        in_cohort(cohort, async {
            tracker.emit(ChatEvent::Delta { agent: "alice".into(), text: "hi".into() });
        })
        .await;
        assert_eq!(tracker.status(cohort, "alice"), Some(AgentStatus::Streaming));
        assert_eq!(tracker.status(cohort, "bob"), Some(AgentStatus::Idle));
        assert_eq!(rx.try_recv().unwrap().event_type(), "delta");

        let progress = tracker.complete(cohort, "alice", Ok("hi".into())).unwrap();
        assert_eq!(progress, CohortProgress { status: AgentStatus::Done, completed: 1, total: 2 });

        let results = tracker.close(cohort);
        assert_eq!(results.len(), 2);
        assert_eq!(tracker.open_cohorts(), 0);
    }

    #[tokio::test]
    async fn sibling_cohorts_sharing_an_agent_stay_separate() {
        let tracker = CohortTracker::new(Arc::new(NullSink));
        let first = tracker.open("master", agents(&["bob"]));
        let second = tracker.open("alice", agents(&["bob"]));

        in_cohort(second, async {
            tracker.emit(ChatEvent::Delta { agent: "bob".into(), text: "x".into() });
        })
        .await;
        assert_eq!(tracker.status(second, "bob"), Some(AgentStatus::Streaming));
        assert_eq!(tracker.status(first, "bob"), Some(AgentStatus::Idle));

        tracker.emit(ChatEvent::Thinking { agent: "bob".into() });
        assert_eq!(tracker.status(first, "bob"), Some(AgentStatus::Idle));
    }

    #[test]
    fn closing_unknown_cohort_is_empty() {
        let tracker = CohortTracker::new(Arc::new(NullSink));
        assert!(tracker.close(CohortId(99)).is_empty());
        assert!(tracker.complete(CohortId(99), "a", Ok(String::new())).is_none());
    }
}
