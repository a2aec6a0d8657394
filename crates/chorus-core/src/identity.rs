use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use secrecy::SecretString;

/// One configured or provisioned agent. Immutable once built; shared as `Arc`.
#[derive(Clone, Debug)]
pub struct AgentIdentity {
    /// Lowercase routing key, the token used in `@name` mentions.
    pub name: String,
    /// Display label.
    pub label: String,
    /// Base URL of the OpenAI-compatible endpoint (without `/chat/completions`).
    pub endpoint: String,
    pub model: Option<String>,
    pub auth_token: Option<SecretString>,
    pub system_prompt: Option<String>,
    pub color: Option<String>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let name = normalize_name(&name.into());
        Self {
            label: capitalize(&name),
            name,
            endpoint: endpoint.into(),
            model: None,
            auth_token: None,
            system_prompt: None,
            color: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// `{endpoint}/chat/completions`, tolerating a trailing slash.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

/// Agent names are matched case-insensitively.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}

/// Uppercase the first character, leave the rest alone.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// The set of known agents plus the coordinator designation.
pub struct AgentDirectory {
    agents: RwLock<HashMap<String, Arc<AgentIdentity>>>,
    coordinator: String,
}

impl AgentDirectory {
    pub fn new(coordinator: &str, agents: impl IntoIterator<Item = AgentIdentity>) -> Self {
        let agents = agents
            .into_iter()
            .map(|a| (a.name.clone(), Arc::new(a)))
            .collect();
        Self {
            agents: RwLock::new(agents),
            coordinator: normalize_name(coordinator),
        }
    }

    pub fn coordinator(&self) -> &str {
        &self.coordinator
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentIdentity>> {
        self.agents.read().get(&normalize_name(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(&normalize_name(name))
    }

    /// Known names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All identities, sorted by name.
    pub fn roster(&self) -> Vec<Arc<AgentIdentity>> {
        let mut roster: Vec<Arc<AgentIdentity>> = self.agents.read().values().cloned().collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        roster
    }

    /// Insert unless the name is already taken. Returns the identity stored
    /// under the name and whether this call inserted it.
    pub fn insert_if_absent(&self, identity: AgentIdentity) -> (Arc<AgentIdentity>, bool) {
        let mut agents = self.agents.write();
        if let Some(existing) = agents.get(&identity.name) {
            return (Arc::clone(existing), false);
        }
        let identity = Arc::new(identity);
        agents.insert(identity.name.clone(), Arc::clone(&identity));
        (identity, true)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
