use serde::{Deserialize, Serialize};

use crate::ids::{ToolCallId, TurnId};

/// Per-agent progress inside a cohort of parallel calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    ToolUse,
    Streaming,
    Done,
    Error,
}

impl AgentStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Outcome of one child branch, reported in `parallel_end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the routing core tells the outside world. Rendering and
/// session logging subscribe to this stream and nothing else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Connecting {
        agent: String,
    },
    Connected {
        agent: String,
    },
    ConnectError {
        agent: String,
        error: String,
    },

    Thinking {
        agent: String,
    },
    Delta {
        agent: String,
        text: String,
    },
    ToolStart {
        agent: String,
        tool_call_id: ToolCallId,
        name: String,
    },
    ToolEnd {
        agent: String,
        tool_call_id: ToolCallId,
        name: String,
    },
    Done {
        agent: String,
        text: String,
    },
    Error {
        agent: String,
        error: String,
    },

    ThreadStart {
        from: String,
        to: String,
        depth: u32,
        message: String,
    },
    ThreadEnd {
        from: String,
        to: String,
        depth: u32,
        ok: bool,
    },

    ParallelStart {
        from: String,
        agents: Vec<String>,
        depth: u32,
    },
    ParallelProgress {
        from: String,
        agent: String,
        status: AgentStatus,
        completed: usize,
        total: usize,
    },
    ParallelEnd {
        from: String,
        results: Vec<AgentResult>,
    },

    AgentSpawned {
        agent: String,
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },

    End {
        turn_id: TurnId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ChatEvent {
    /// The agent this event is about, when there is exactly one.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::Connecting { agent }
            | Self::Connected { agent }
            | Self::ConnectError { agent, .. }
            | Self::Thinking { agent }
            | Self::Delta { agent, .. }
            | Self::ToolStart { agent, .. }
            | Self::ToolEnd { agent, .. }
            | Self::Done { agent, .. }
            | Self::Error { agent, .. }
            | Self::ParallelProgress { agent, .. }
            | Self::AgentSpawned { agent, .. } => Some(agent),
            Self::ThreadStart { to, .. } | Self::ThreadEnd { to, .. } => Some(to),
            Self::ParallelStart { .. } | Self::ParallelEnd { .. } | Self::End { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::ConnectError { .. } => "connect_error",
            Self::Thinking { .. } => "thinking",
            Self::Delta { .. } => "delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::ThreadStart { .. } => "thread_start",
            Self::ThreadEnd { .. } => "thread_end",
            Self::ParallelStart { .. } => "parallel_start",
            Self::ParallelProgress { .. } => "parallel_progress",
            Self::ParallelEnd { .. } => "parallel_end",
            Self::AgentSpawned { .. } => "agent_spawned",
            Self::End { .. } => "end",
        }
    }
}
