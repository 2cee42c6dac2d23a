//! Remote-Coder Session Manager: owns the `(session → messages)`
//! store for chat-driven agent runs, backed by SQLite with a background
//! retention sweep that purges stale messages and idle sessions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCoderMessage {
    pub role: MessageRole,
    pub content: String,
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCoderSession {
    pub id: Uuid,
    pub status: SessionStatus,
    pub request: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub messages: Vec<RemoteCoderMessage>,
}

pub struct RemoteCoderManager {
    conn: Arc<RwLock<Connection>>,
    default_timeout: chrono::Duration,
}

impl RemoteCoderManager {
    pub fn open(path: &Path, default_timeout_secs: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening remote-coder db {}", path.display()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
            default_timeout: chrono::Duration::seconds(default_timeout_secs),
        })
    }

    pub fn open_in_memory(default_timeout_secs: i64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
            default_timeout: chrono::Duration::seconds(default_timeout_secs),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS remote_coder_sessions (
                 id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 request TEXT NOT NULL,
                 response TEXT,
                 error TEXT,
                 created_at TEXT NOT NULL,
                 last_activity TEXT NOT NULL,
                 expires_at TEXT NOT NULL,
                 context TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS remote_coder_messages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 role TEXT NOT NULL,
                 content TEXT NOT NULL,
                 summary TEXT,
                 timestamp TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_rc_messages_session ON remote_coder_messages(session_id);",
        )
        .context("creating remote-coder schema")?;
        Ok(())
    }

    /// Allocates a session, stamping `created_at`/`last_activity` to now
    /// and `expires_at` to `now + timeout`.
    pub async fn create(&self, request: &str) -> Result<RemoteCoderSession> {
        let now = Utc::now();
        let session = RemoteCoderSession {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            request: request.to_string(),
            response: None,
            error: None,
            created_at: now,
            last_activity: now,
            expires_at: now + self.default_timeout,
            context: HashMap::new(),
            messages: Vec::new(),
        };
        self.persist(&session).await?;
        Ok(session)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RemoteCoderSession>> {
        let conn = self.conn.read().await;
        let Some(mut session) = conn
            .query_row(
                "SELECT id, status, request, response, error, created_at, last_activity, expires_at, context
                 FROM remote_coder_sessions WHERE id = ?1",
                params![id.to_string()],
                map_session_row,
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT role, content, summary, timestamp FROM remote_coder_messages
             WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], map_message_row)?;
        session.messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(session))
    }

    /// Applies `mutator` to the session (sans its message log) and
    /// refreshes `last_activity`, re-persisting.
    pub async fn update(&self, id: Uuid, mutator: impl FnOnce(&mut RemoteCoderSession)) -> Result<()> {
        let mut session = self
            .get(id)
            .await?
            .context("remote-coder session not found")?;
        mutator(&mut session);
        session.last_activity = Utc::now();
        self.persist(&session).await
    }

    /// The only mutation that appends to a session's message log.
    pub async fn append_message(&self, id: Uuid, role: MessageRole, content: &str, summary: Option<String>) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO remote_coder_messages (session_id, role, content, summary, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), role.to_string(), content, summary, now.to_rfc3339()],
        )?;
        conn.execute(
            "UPDATE remote_coder_sessions SET last_activity = ?2 WHERE id = ?1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Transitions to `closed` and deletes the session plus its messages.
    pub async fn close(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute("DELETE FROM remote_coder_messages WHERE session_id = ?1", params![id.to_string()])?;
        conn.execute("DELETE FROM remote_coder_sessions WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    async fn persist(&self, session: &RemoteCoderSession) -> Result<()> {
        let context = serde_json::to_string(&session.context).context("serializing context")?;
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO remote_coder_sessions
             (id, status, request, response, error, created_at, last_activity, expires_at, context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 request = excluded.request,
                 response = excluded.response,
                 error = excluded.error,
                 last_activity = excluded.last_activity,
                 expires_at = excluded.expires_at,
                 context = excluded.context",
            params![
                session.id.to_string(),
                session.status.to_string(),
                session.request,
                session.response,
                session.error,
                session.created_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                context,
            ],
        )?;
        Ok(())
    }

    /// Deletes messages older than `message_cutoff` and evicts non-running
    /// sessions whose `last_activity` precedes `session_cutoff`.
    pub async fn purge(&self, message_cutoff: DateTime<Utc>, session_cutoff: DateTime<Utc>) -> Result<(u64, u64)> {
        let conn = self.conn.write().await;
        let messages_deleted = conn.execute(
            "DELETE FROM remote_coder_messages WHERE timestamp < ?1",
            params![message_cutoff.to_rfc3339()],
        )?;
        let sessions_deleted = conn.execute(
            "DELETE FROM remote_coder_sessions WHERE status != 'running' AND last_activity < ?1",
            params![session_cutoff.to_rfc3339()],
        )?;
        Ok((messages_deleted as u64, sessions_deleted as u64))
    }
}

fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<RemoteCoderSession> {
    let status: String = row.get(1)?;
    let context: String = row.get(8)?;
    Ok(RemoteCoderSession {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        status: status.parse().unwrap_or(SessionStatus::Expired),
        request: row.get(2)?,
        response: row.get(3)?,
        error: row.get(4)?,
        created_at: parse_dt(row.get::<_, String>(5)?),
        last_activity: parse_dt(row.get::<_, String>(6)?),
        expires_at: parse_dt(row.get::<_, String>(7)?),
        context: serde_json::from_str(&context).unwrap_or_default(),
        messages: Vec::new(),
    })
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<RemoteCoderMessage> {
    let role: String = row.get(0)?;
    Ok(RemoteCoderMessage {
        role: role.parse().unwrap_or(MessageRole::User),
        content: row.get(1)?,
        summary: row.get(2)?,
        timestamp: parse_dt(row.get::<_, String>(3)?),
    })
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Runs `purge` on `interval` until the process shuts down. Intended to be
/// spawned once at startup.
pub async fn run_retention_loop(manager: Arc<RemoteCoderManager>, interval: std::time::Duration, retention: chrono::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - retention;
        let _ = manager.purge(cutoff, cutoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_append_and_fetch_roundtrips() {
        let manager = RemoteCoderManager::open_in_memory(1800).unwrap();
        let session = manager.create("fix the bug").await.unwrap();
        manager
            .append_message(session.id, MessageRole::User, "fix the bug", None)
            .await
            .unwrap();
        manager
            .append_message(session.id, MessageRole::Assistant, "done", Some("applied patch".into()))
            .await
            .unwrap();

        let fetched = manager.get(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.messages.len(), 2);
        assert_eq!(fetched.messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn update_refreshes_last_activity_and_status() {
        let manager = RemoteCoderManager::open_in_memory(1800).unwrap();
        let session = manager.create("task").await.unwrap();
        let before = session.last_activity;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager
            .update(session.id, |s| s.status = SessionStatus::Running)
            .await
            .unwrap();
        let updated = manager.get(session.id).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert!(updated.last_activity >= before);
    }

    #[tokio::test]
    async fn close_deletes_session_and_messages() {
        let manager = RemoteCoderManager::open_in_memory(1800).unwrap();
        let session = manager.create("task").await.unwrap();
        manager.append_message(session.id, MessageRole::User, "hi", None).await.unwrap();
        manager.close(session.id).await.unwrap();
        assert!(manager.get(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_evicts_idle_non_running_sessions() {
        let manager = RemoteCoderManager::open_in_memory(1800).unwrap();
        let session = manager.create("old task").await.unwrap();
        let future_cutoff = Utc::now() + chrono::Duration::hours(1);
        let (_, sessions_deleted) = manager.purge(future_cutoff, future_cutoff).await.unwrap();
        assert_eq!(sessions_deleted, 1);
        assert!(manager.get(session.id).await.unwrap().is_none());
    }
}
