pub mod config;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod messages;
pub mod sink;
pub mod stream;

pub use config::{ConfigProvider, MentionCap, SecretsProvider, Settings, SwarmConfig, VocabularyMode};
pub use errors::{ClientError, ConfigError};
pub use events::{AgentResult, AgentStatus, ChatEvent};
pub use identity::{AgentDirectory, AgentIdentity};
pub use messages::{ChatMessage, ConversationHistory, Role};
pub use sink::{EventSink, NullSink};
