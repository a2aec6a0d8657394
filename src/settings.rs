//! JSON settings file (`~/.chorus/settings.json` by default).
//!
//! Missing keys fall back to defaults. A few routing limits can be overridden
//! from the environment; invalid values are ignored.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use chorus_core::config::{AgentSettings, ConfigProvider, MentionCap, Settings};
use chorus_core::errors::ConfigError;
use chorus_core::identity::AgentIdentity;

pub fn default_settings_path() -> PathBuf {
    chorus_home().join("settings.json")
}

pub fn default_db_path() -> PathBuf {
    chorus_home().join("chorus.db")
}

fn chorus_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chorus")
}

/// [`ConfigProvider`] backed by one JSON file.
pub struct JsonSettings {
    path: PathBuf,
}

impl JsonSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_value(&self) -> Result<Option<Value>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let value = serde_json::from_str(&content)?;
        Ok(Some(value))
    }
}

impl ConfigProvider for JsonSettings {
    fn load(&self) -> Result<Settings, ConfigError> {
        let mut settings: Settings = match self.read_value()? {
            Some(value) => {
                debug!(path = %self.path.display(), "loading settings from file");
                serde_json::from_value(value)?
            }
            None => {
                debug!(path = %self.path.display(), "settings file not found, using defaults");
                Settings::default()
            }
        };
        apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Rewrite the `agents` list, leaving every other key as it was.
    fn save_agents(&self, agents: &[AgentIdentity]) -> Result<(), ConfigError> {
        let mut root = match self.read_value()? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ConfigError::Invalid(format!(
                    "{} does not hold a JSON object",
                    self.path.display()
                )))
            }
            None => serde_json::Map::new(),
        };
        let count = agents.len();
        let agents: Vec<AgentSettings> = agents.iter().map(AgentSettings::from).collect();
        let agents = serde_json::to_value(agents)?;
        let _ = root.insert("agents".to_string(), agents);

        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                parent
            }
            None => Path::new("."),
        };
        let json = serde_json::to_string_pretty(&Value::Object(root))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), count, "agents saved");
        Ok(())
    }
}

/// Environment overrides for routing limits.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("CHORUS_COORDINATOR") {
        settings.swarm.coordinator = v;
    }
    if let Some(v) = read_env_u32("CHORUS_MAX_MENTION_DEPTH", 0, 32) {
        settings.swarm.max_mention_depth = v;
    }
    if let Some(v) = read_env_string("CHORUS_MENTION_CAP") {
        if v.eq_ignore_ascii_case("unlimited") {
            settings.swarm.mention_cap = MentionCap::Unlimited;
        } else if let Ok(n) = v.parse::<usize>() {
            settings.swarm.mention_cap = MentionCap::Limited(n);
        }
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    read_env_string(name)?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}
