//! # chorus
//!
//! Line-oriented front end: each stdin line is one user turn, every routing
//! event is printed to stdout as a JSON line, logs go to stderr.

#![deny(unsafe_code)]

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use chorus_core::config::{ConfigProvider, EnvSecrets};
use chorus_core::events::ChatEvent;
use chorus_core::identity::AgentDirectory;
use chorus_core::ids::SessionId;
use chorus_engine::Router;
use chorus_llm::HttpTransport;
use chorus_store::{Database, HistoryRepo};
use chorus_telemetry::{init_telemetry, TelemetryConfig};

use crate::settings::JsonSettings;

/// Route @mentions between a team of chat-completion agents.
#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Multi-agent @mention router")]
struct Cli {
    /// Settings file (default `~/.chorus/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// `SQLite` database holding saved sessions.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Resume this session instead of starting a new one.
    #[arg(long)]
    session: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Default log level.
    #[arg(long, default_value = "warn")]
    log_level: Level,

    /// Log this module at debug level (repeatable).
    #[arg(long = "debug", value_name = "MODULE")]
    debug_modules: Vec<String>,

    /// Print saved sessions and exit.
    #[arg(long)]
    list_sessions: bool,

    /// Delete a saved session and exit.
    #[arg(long, value_name = "SESSION")]
    forget: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli
            .debug_modules
            .iter()
            .map(|m| (m.clone(), Level::DEBUG))
            .collect(),
        json: cli.json_logs,
    })?;

    let db_path = cli.db.clone().unwrap_or_else(settings::default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let histories = HistoryRepo::new(db);

    if cli.list_sessions {
        for session in histories.list_sessions(50)? {
            println!("{}\t{} agents\t{}", session.id.as_str(), session.agent_count, session.updated_at);
        }
        return Ok(());
    }
    if let Some(id) = &cli.forget {
        let removed = histories.delete_session(&SessionId::from_raw(id.as_str()))?;
        println!("{}", if removed { "deleted" } else { "no such session" });
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(settings::default_settings_path);
    let provider = Arc::new(JsonSettings::new(config_path));
    let settings = provider
        .load()
        .with_context(|| format!("failed to load settings from {}", provider.path().display()))?;
    info!(
        agents = settings.agents.len(),
        coordinator = %settings.swarm.coordinator,
        "settings loaded"
    );

    let directory = Arc::new(AgentDirectory::new(
        &settings.swarm.coordinator,
        settings.identities(),
    ));
    let transport = Arc::new(HttpTransport::new()?);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx));

    let router = Router::new(
        settings.swarm.clone(),
        directory,
        transport,
        Arc::new(EnvSecrets::default()),
        Arc::new(event_tx),
    )
    .with_config_provider(provider);

    let session = match cli.session {
        Some(id) => {
            let id = SessionId::from_raw(id);
            let restored = restore_session(&router, &histories, &id)?;
            info!(session = %id.as_str(), restored, "session resumed");
            id
        }
        None => SessionId::new(),
    };
    eprintln!("session {}", session.as_str());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/quit" | "/exit") {
            break;
        }
        if let Err(e) = router.turn(line).await {
            warn!(error = %e, "turn failed");
        }
        save_session(&router, &histories, &session).await;
    }

    drop(router);
    let _ = printer.await;
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<ChatEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(mut line) => {
                line.push('\n');
                let _ = stdout.write_all(line.as_bytes()).await;
                let _ = stdout.flush().await;
            }
            Err(e) => warn!(error = %e, "failed to encode event"),
        }
    }
}

/// Stage every saved history so each agent resumes it on first connect.
fn restore_session(router: &Router, histories: &HistoryRepo, session: &SessionId) -> Result<usize> {
    let agents = histories.list_agents(session)?;
    let mut restored = 0;
    for agent in agents {
        if let Some(history) = histories.load(session, &agent)? {
            router.registry().stage_history(&agent, history);
            restored += 1;
        }
    }
    Ok(restored)
}

async fn save_session(router: &Router, histories: &HistoryRepo, session: &SessionId) {
    for name in router.registry().connected_names() {
        let Some(client) = router.registry().client(&name) else {
            continue;
        };
        let history = client.history().await;
        if let Err(e) = histories.save(session, &name, &history) {
            warn!(agent = %name, error = %e, "failed to save history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "chorus",
            "--config",
            "/tmp/s.json",
            "--session",
            "sess_1",
            "--json-logs",
            "--log-level",
            "debug",
            "--debug",
            "chorus_engine",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(cli.session.as_deref(), Some("sess_1"));
        assert!(cli.json_logs);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert_eq!(cli.debug_modules, vec!["chorus_engine"]);
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["chorus"]).unwrap();
        assert_eq!(cli.log_level, Level::WARN);
        assert!(cli.session.is_none());
        assert!(!cli.list_sessions);
    }

    #[tokio::test]
    async fn saved_session_is_restored() {
        use chorus_core::config::{StaticSecrets, SwarmConfig};
        use chorus_core::identity::AgentIdentity;
        use chorus_core::sink::NullSink;
        use chorus_llm::{MockReply, MockTransport};

        let histories = HistoryRepo::new(Database::in_memory().unwrap());
        let session = SessionId::from_raw("sess_test");
        let build = |transport: Arc<MockTransport>| {
            Router::new(
                SwarmConfig::default(),
                Arc::new(AgentDirectory::new("master", [AgentIdentity::new("master", "http://m")])),
                transport,
                Arc::new(StaticSecrets::default()),
                Arc::new(NullSink),
            )
        };

        let transport = Arc::new(MockTransport::new());
        transport.push_reply("master", MockReply::text("hello"));
        let router = build(Arc::clone(&transport));
        router.turn("hi").await.unwrap();
        save_session(&router, &histories, &session).await;

        let transport = Arc::new(MockTransport::new());
        transport.push_reply("master", MockReply::text("welcome back"));
        let router = build(Arc::clone(&transport));
        assert_eq!(restore_session(&router, &histories, &session).unwrap(), 1);
        router.turn("again").await.unwrap();

        let request = &transport.requests("master")[0];
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].content, "hi");
    }
}
