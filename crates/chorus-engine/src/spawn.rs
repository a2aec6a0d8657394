//! Provisioning of agents first met as `@mentions` in open-vocabulary mode.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chorus_core::identity::{capitalize, normalize_name, AgentIdentity};

/// Rotating display colours for provisioned agents.
pub const PALETTE: &[&str] = &[
    "cyan", "magenta", "yellow", "green", "blue", "red", "bright_cyan", "bright_magenta",
];

/// Builds identities for agents that are not configured.
pub struct AgentFactory {
    next_color: AtomicUsize,
}

impl AgentFactory {
    /// `start` is the palette offset of the first provisioned agent, usually
    /// the number of configured agents so colours do not repeat early.
    pub fn new(start: usize) -> Self {
        Self {
            next_color: AtomicUsize::new(start),
        }
    }

    pub fn next_color(&self) -> &'static str {
        let i = self.next_color.fetch_add(1, Ordering::Relaxed);
        PALETTE[i % PALETTE.len()]
    }

    /// Identity for `name` inheriting the coordinator's endpoint, model and
    /// credentials. `roster` is the team as it stands, excluding `name`.
    pub fn provision(
        &self,
        name: &str,
        coordinator: &AgentIdentity,
        roster: &[Arc<AgentIdentity>],
    ) -> AgentIdentity {
        let name = normalize_name(name);
        let label = capitalize(&name);
        let prompt = team_prompt(&name, &label, &coordinator.name, roster);

        let mut identity = AgentIdentity::new(name, coordinator.endpoint.clone())
            .with_label(label)
            .with_system_prompt(prompt)
            .with_color(self.next_color());
        identity.model = coordinator.model.clone();
        identity.auth_token = coordinator.auth_token.clone();
        identity
    }
}

/// System prompt placing an agent in the team.
pub fn team_prompt(
    name: &str,
    label: &str,
    coordinator: &str,
    roster: &[Arc<AgentIdentity>],
) -> String {
    let mut prompt = format!(
        "You are {label}, a member of a team of AI agents collaborating in one conversation. \
         Your handle is @{name}.\n\n"
    );

    let peers: Vec<&Arc<AgentIdentity>> = roster.iter().filter(|a| a.name != name).collect();
    if peers.is_empty() {
        prompt.push_str("You have no teammates yet.\n");
    } else {
        prompt.push_str("Your teammates:\n");
        for peer in peers {
            let role = if peer.name == coordinator { " (coordinator)" } else { "" };
            let _ = writeln!(prompt, "- @{} ({}){role}", peer.name, peer.label);
        }
    }

    let _ = write!(
        prompt,
        "\n@{coordinator} coordinates the team and talks to the user.\n\n\
         To ask a teammate something, write @name followed by your request. \
         Everything up to the next @mention goes to that teammate. \
         Their answers come back to you as lines of the form \
         \"name replied: ...\"; use them to write your final answer. \
         Only mention a teammate when you need their help."
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn coordinator() -> AgentIdentity {
        AgentIdentity::new("master", "http://gateway/v1")
            .with_model("gpt-x")
            .with_auth_token("sk-coord")
    }

    #[test]
    fn provision_copies_coordinator_defaults() {
        let factory = AgentFactory::new(0);
        let roster = vec![Arc::new(coordinator())];
        let id = factory.provision("@Analyst", &coordinator(), &roster);

        assert_eq!(id.name, "analyst");
        assert_eq!(id.label, "Analyst");
        assert_eq!(id.endpoint, "http://gateway/v1");
        assert_eq!(id.model.as_deref(), Some("gpt-x"));
        assert_eq!(id.auth_token.as_ref().unwrap().expose_secret(), "sk-coord");
        assert_eq!(id.color.as_deref(), Some(PALETTE[0]));
        assert!(id.system_prompt.unwrap().contains("@analyst"));
    }

    #[test]
    fn palette_rotates() {
        let factory = AgentFactory::new(PALETTE.len() - 1);
        assert_eq!(factory.next_color(), PALETTE[PALETTE.len() - 1]);
        assert_eq!(factory.next_color(), PALETTE[0]);
        assert_eq!(factory.next_color(), PALETTE[1]);
    }

    #[test]
    fn team_prompt_lists_peers_and_coordinator() {
        let roster = vec![
            Arc::new(AgentIdentity::new("master", "http://m")),
            Arc::new(AgentIdentity::new("researcher", "http://r")),
        ];
        let prompt = team_prompt("analyst", "Analyst", "master", &roster);
        assert!(prompt.contains("- @master (Master) (coordinator)"));
        assert!(prompt.contains("- @researcher (Researcher)"));
        assert!(prompt.contains("replied:"));
        assert!(!prompt.contains("- @analyst"));
    }

    #[test]
    fn team_prompt_without_peers() {
        let prompt = team_prompt("solo", "Solo", "master", &[]);
        assert!(prompt.contains("no teammates"));
    }
}
