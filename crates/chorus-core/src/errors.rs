use std::time::Duration;

/// Errors raised while talking to an agent's chat-completion endpoint.
///
/// `Connect` and `Http` happen before any reply bytes are read; the stream
/// variants happen after the request was accepted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    // Before the stream
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    // During the stream
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Per frame; logged and skipped by the parser
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// True when the request never produced a response body.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Http { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect_error",
            Self::Http { .. } => "http_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol_error",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        Self::Http { status, body }
    }
}

/// Errors raised by configuration providers.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
