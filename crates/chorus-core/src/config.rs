use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::identity::{capitalize, normalize_name, AgentIdentity};

/// Upper bound on mention dispatches per user turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum MentionCap {
    Limited(usize),
    Unlimited,
}

impl MentionCap {
    /// Whether `total` dispatches fit under the cap.
    pub fn allows(&self, total: usize) -> bool {
        match self {
            Self::Limited(cap) => total <= *cap,
            Self::Unlimited => true,
        }
    }
}

impl From<Option<usize>> for MentionCap {
    fn from(v: Option<usize>) -> Self {
        v.map_or(Self::Unlimited, Self::Limited)
    }
}

impl From<MentionCap> for Option<usize> {
    fn from(cap: MentionCap) -> Self {
        match cap {
            MentionCap::Limited(n) => Some(n),
            MentionCap::Unlimited => None,
        }
    }
}

/// Whether `@name` tokens outside the known roster are ignored or provision
/// a new agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyMode {
    #[default]
    Closed,
    Open,
}

/// Routing limits and timeouts for one swarm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub coordinator: String,
    /// Deepest depth at which a branch may still be dispatched.
    pub max_mention_depth: u32,
    pub mention_cap: MentionCap,
    #[serde(with = "duration_secs", rename = "request_timeout_secs")]
    pub request_timeout: Duration,
    #[serde(with = "duration_secs", rename = "connect_timeout_secs")]
    pub connect_timeout: Duration,
    pub vocabulary: VocabularyMode,
    /// Fold-back rounds one branch may run before its reply is final.
    pub max_synthesis_rounds: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            coordinator: "master".into(),
            max_mention_depth: 3,
            mention_cap: MentionCap::Limited(10),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            vocabulary: VocabularyMode::Closed,
            max_synthesis_rounds: 3,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// On-disk shape of one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl From<AgentSettings> for AgentIdentity {
    fn from(s: AgentSettings) -> Self {
        let name = normalize_name(&s.name);
        AgentIdentity {
            label: s.label.unwrap_or_else(|| capitalize(&name)),
            name,
            endpoint: s.endpoint,
            model: s.model,
            auth_token: s.auth_token.map(SecretString::from),
            system_prompt: s.system_prompt,
            color: s.color,
        }
    }
}

impl From<&AgentIdentity> for AgentSettings {
    fn from(a: &AgentIdentity) -> Self {
        Self {
            name: a.name.clone(),
            label: Some(a.label.clone()),
            endpoint: a.endpoint.clone(),
            model: a.model.clone(),
            auth_token: a.auth_token.as_ref().map(|t| t.expose_secret().to_string()),
            system_prompt: a.system_prompt.clone(),
            color: a.color.clone(),
        }
    }
}

/// Everything a configuration provider hands to the core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub agents: Vec<AgentSettings>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let coordinator = normalize_name(&self.swarm.coordinator);
        if !self.agents.iter().any(|a| normalize_name(&a.name) == coordinator) {
            return Err(ConfigError::Invalid(format!(
                "coordinator '{coordinator}' is not a configured agent"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(normalize_name(&agent.name)) {
                return Err(ConfigError::Invalid(format!("duplicate agent '{}'", agent.name)));
            }
        }
        Ok(())
    }

    pub fn identities(&self) -> Vec<AgentIdentity> {
        self.agents.iter().cloned().map(AgentIdentity::from).collect()
    }
}

/// Supplies settings and persists agents provisioned at runtime.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<Settings, ConfigError>;
    fn save_agents(&self, agents: &[AgentIdentity]) -> Result<(), ConfigError>;
}

/// Supplies the bearer token for agents without one of their own.
pub trait SecretsProvider: Send + Sync {
    fn bearer_token(&self, agent: &AgentIdentity) -> Option<SecretString>;
}

/// Reads the fallback token from the environment.
#[derive(Clone, Debug)]
pub struct EnvSecrets {
    vars: Vec<String>,
}

impl EnvSecrets {
    pub fn new(vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new(["CHORUS_API_KEY", "OPENAI_API_KEY"])
    }
}

impl SecretsProvider for EnvSecrets {
    fn bearer_token(&self, agent: &AgentIdentity) -> Option<SecretString> {
        if let Some(token) = &agent.auth_token {
            return Some(token.clone());
        }
        self.vars
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .map(SecretString::from)
    }
}

/// Fixed fallback token (or none).
#[derive(Clone, Debug, Default)]
pub struct StaticSecrets {
    token: Option<SecretString>,
}

impl StaticSecrets {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(|t| SecretString::from(t.to_string())),
        }
    }
}

impl SecretsProvider for StaticSecrets {
    fn bearer_token(&self, agent: &AgentIdentity) -> Option<SecretString> {
        agent.auth_token.clone().or_else(|| self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swarm_defaults() {
        let cfg = SwarmConfig::default();
        assert_eq!(cfg.max_mention_depth, 3);
        assert_eq!(cfg.mention_cap, MentionCap::Limited(10));
        assert_eq!(cfg.request_timeout, Duration::from_secs(120));
        assert_eq!(cfg.vocabulary, VocabularyMode::Closed);
    }

    #[test]
    fn mention_cap_allows() {
        assert!(MentionCap::Limited(5).allows(5));
        assert!(!MentionCap::Limited(5).allows(6));
        assert!(MentionCap::Unlimited.allows(usize::MAX));
    }

    #[test]
    fn settings_parse_with_defaults() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "swarm": {"coordinator": "Master", "mention_cap": null, "request_timeout_secs": 30},
            "agents": [
                {"name": "master", "endpoint": "http://localhost:1/v1"},
                {"name": "Researcher", "endpoint": "http://localhost:2/v1", "model": "gpt-4o"}
            ]
        }))
        .unwrap();
        assert_eq!(settings.swarm.mention_cap, MentionCap::Unlimited);
        assert_eq!(settings.swarm.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.swarm.max_mention_depth, 3);
        settings.validate().unwrap();

        let ids = settings.identities();
        assert_eq!(ids[1].name, "researcher");
        assert_eq!(ids[1].label, "Researcher");
    }

    #[test]
    fn validate_rejects_missing_coordinator() {
        let settings = Settings {
            swarm: SwarmConfig { coordinator: "boss".into(), ..Default::default() },
            agents: vec![],
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn agent_settings_roundtrip_through_identity() {
        let settings = AgentSettings {
            name: "alice".into(),
            label: Some("Alice".into()),
            endpoint: "http://a".into(),
            model: None,
            auth_token: Some("tok".into()),
            system_prompt: None,
            color: Some("cyan".into()),
        };
        let identity = AgentIdentity::from(settings.clone());
        assert_eq!(AgentSettings::from(&identity), settings);
    }

    #[test]
    fn static_secrets_prefer_agent_token() {
        let secrets = StaticSecrets::new(Some("fallback"));
        let with = AgentIdentity::new("a", "http://a").with_auth_token("own");
        let without = AgentIdentity::new("b", "http://b");
        assert_eq!(secrets.bearer_token(&with).unwrap().expose_secret(), "own");
        assert_eq!(secrets.bearer_token(&without).unwrap().expose_secret(), "fallback");
    }
}
