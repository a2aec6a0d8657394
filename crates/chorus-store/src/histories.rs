use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use chorus_core::identity::normalize_name;
use chorus_core::ids::SessionId;
use chorus_core::messages::ConversationHistory;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub agent_count: usize,
    pub updated_at: String,
}

/// Per-agent conversation histories, keyed by session.
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace one agent's history, creating the session on first use.
    #[instrument(skip(self, history), fields(messages = history.len()))]
    pub fn save(
        &self,
        session: &SessionId,
        agent: &str,
        history: &ConversationHistory,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let messages = serde_json::to_string(history)?;
        let agent = normalize_name(agent);

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
                rusqlite::params![session.as_str(), now],
            )?;
            tx.execute(
                "INSERT INTO histories (session_id, agent, messages, message_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id, agent) DO UPDATE SET
                    messages = excluded.messages,
                    message_count = excluded.message_count,
                    updated_at = excluded.updated_at",
                rusqlite::params![session.as_str(), agent, messages, history.len() as i64, now],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Load one agent's history; `None` if it was never saved.
    #[instrument(skip(self))]
    pub fn load(
        &self,
        session: &SessionId,
        agent: &str,
    ) -> Result<Option<ConversationHistory>, StoreError> {
        let agent = normalize_name(agent);
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT messages FROM histories WHERE session_id = ?1 AND agent = ?2",
                    rusqlite::params![session.as_str(), agent],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|raw| row_helpers::parse_json(&raw, "histories", "messages"))
            .transpose()
    }

    /// Agents with a saved history in `session`, sorted by name.
    pub fn list_agents(&self, session: &SessionId) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent FROM histories WHERE session_id = ?1 ORDER BY agent",
            )?;
            let rows = stmt.query_map([session.as_str()], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Sessions, most recently updated first.
    pub fn list_sessions(&self, limit: u32) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, COUNT(h.agent), s.updated_at
                 FROM sessions s LEFT JOIN histories h ON h.session_id = s.id
                 GROUP BY s.id
                 ORDER BY s.updated_at DESC, s.id DESC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "sessions", "id")?;
                let count: i64 = row_helpers::get(row, 1, "histories", "agent")?;
                sessions.push(SessionSummary {
                    id: SessionId::from_raw(id),
                    agent_count: count as usize,
                    updated_at: row_helpers::get(row, 2, "sessions", "updated_at")?,
                });
            }
            Ok(sessions)
        })
    }

    /// Delete a session and all its histories. Returns false if it did not exist.
    #[instrument(skip(self))]
    pub fn delete_session(&self, session: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM histories WHERE session_id = ?1", [session.as_str()])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [session.as_str()])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }
}
