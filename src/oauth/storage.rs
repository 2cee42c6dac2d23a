//! SQLite-backed token/session storage.
//!
//! Same `Arc<RwLock<Connection>>` idiom as `rules::store` and `usage`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{OAuthSession, OAuthToken, SessionStatus};

pub struct OAuthStore {
    conn: Arc<RwLock<Connection>>,
}

impl OAuthStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening oauth db {}", path.display()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS oauth_tokens (
                 provider_uuid TEXT PRIMARY KEY,
                 provider TEXT NOT NULL,
                 access_token TEXT NOT NULL,
                 refresh_token TEXT,
                 token_type TEXT NOT NULL,
                 expiry INTEGER NOT NULL,
                 scope TEXT,
                 user_id TEXT
             );
             CREATE TABLE IF NOT EXISTS oauth_sessions (
                 session_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 provider TEXT NOT NULL,
                 user_id TEXT,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL,
                 provider_uuid TEXT,
                 error TEXT,
                 pending_secret TEXT
             );",
        )
        .context("creating oauth schema")?;
        Ok(())
    }

    pub async fn put_token(&self, provider_uuid: Uuid, token: &OAuthToken) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO oauth_tokens
                 (provider_uuid, provider, access_token, refresh_token, token_type, expiry, scope, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(provider_uuid) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_type = excluded.token_type,
                 expiry = excluded.expiry,
                 scope = excluded.scope,
                 user_id = excluded.user_id",
            params![
                provider_uuid.to_string(),
                token.provider,
                token.access_token,
                token.refresh_token,
                token.token_type,
                token.expiry,
                token.scope,
                token.user_id,
            ],
        )?;
        Ok(())
    }

    pub async fn get_token(&self, provider_uuid: Uuid) -> Result<Option<OAuthToken>> {
        let conn = self.conn.read().await;
        let row = conn
            .query_row(
                "SELECT provider, access_token, refresh_token, token_type, expiry, scope, user_id
                 FROM oauth_tokens WHERE provider_uuid = ?1",
                params![provider_uuid.to_string()],
                |r| {
                    Ok(OAuthToken {
                        provider: r.get(0)?,
                        access_token: r.get(1)?,
                        refresh_token: r.get(2)?,
                        token_type: r.get(3)?,
                        expiry: r.get(4)?,
                        scope: r.get(5)?,
                        user_id: r.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn all_tokens(&self) -> Result<Vec<(Uuid, OAuthToken)>> {
        let conn = self.conn.read().await;
        let mut stmt = conn.prepare(
            "SELECT provider_uuid, provider, access_token, refresh_token, token_type, expiry, scope, user_id
             FROM oauth_tokens",
        )?;
        let rows = stmt.query_map([], |r| {
            let id: String = r.get(0)?;
            Ok((
                id,
                OAuthToken {
                    provider: r.get(1)?,
                    access_token: r.get(2)?,
                    refresh_token: r.get(3)?,
                    token_type: r.get(4)?,
                    expiry: r.get(5)?,
                    scope: r.get(6)?,
                    user_id: r.get(7)?,
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, token) = row?;
            if let Ok(uuid) = Uuid::parse_str(&id) {
                out.push((uuid, token));
            }
        }
        Ok(out)
    }

    pub async fn delete_token(&self, provider_uuid: Uuid) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "DELETE FROM oauth_tokens WHERE provider_uuid = ?1",
            params![provider_uuid.to_string()],
        )?;
        Ok(())
    }

    pub async fn put_session(&self, session: &OAuthSession) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO oauth_sessions
                 (session_id, status, provider, user_id, created_at, expires_at, provider_uuid, error, pending_secret)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id) DO UPDATE SET
                 status = excluded.status,
                 user_id = excluded.user_id,
                 provider_uuid = excluded.provider_uuid,
                 error = excluded.error,
                 pending_secret = excluded.pending_secret",
            params![
                session.session_id.to_string(),
                status_str(session.status),
                session.provider,
                session.user_id,
                session.created_at,
                session.expires_at,
                session.provider_uuid.map(|u| u.to_string()),
                session.error,
                session.pending_secret,
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<OAuthSession>> {
        let conn = self.conn.read().await;
        let row = conn
            .query_row(
                "SELECT session_id, status, provider, user_id, created_at, expires_at,
                        provider_uuid, error, pending_secret
                 FROM oauth_sessions WHERE session_id = ?1",
                params![session_id.to_string()],
                map_session_row,
            )
            .optional()?;
        Ok(row)
    }
}

fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Pending => "pending",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Expired => "expired",
    }
}

fn parse_status(s: &str) -> SessionStatus {
    match s {
        "completed" => SessionStatus::Completed,
        "failed" => SessionStatus::Failed,
        "expired" => SessionStatus::Expired,
        _ => SessionStatus::Pending,
    }
}

fn map_session_row(r: &rusqlite::Row) -> rusqlite::Result<OAuthSession> {
    let session_id: String = r.get(0)?;
    let status: String = r.get(1)?;
    let provider_uuid: Option<String> = r.get(6)?;
    Ok(OAuthSession {
        session_id: Uuid::parse_str(&session_id).unwrap_or_default(),
        status: parse_status(&status),
        provider: r.get(2)?,
        user_id: r.get(3)?,
        created_at: r.get(4)?,
        expires_at: r.get(5)?,
        provider_uuid: provider_uuid.and_then(|s| Uuid::parse_str(&s).ok()),
        error: r.get(7)?,
        pending_secret: r.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token(provider: &str) -> OAuthToken {
        OAuthToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            token_type: "Bearer".into(),
            expiry: 1_000_000,
            scope: None,
            provider: provider.into(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn token_round_trips_and_updates() {
        let store = OAuthStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        assert!(store.get_token(id).await.unwrap().is_none());
        store.put_token(id, &sample_token("github-copilot")).await.unwrap();
        let fetched = store.get_token(id).await.unwrap().unwrap();
        assert_eq!(fetched.access_token, "at");

        let mut updated = sample_token("github-copilot");
        updated.access_token = "at2".into();
        store.put_token(id, &updated).await.unwrap();
        assert_eq!(store.get_token(id).await.unwrap().unwrap().access_token, "at2");
    }

    #[tokio::test]
    async fn session_round_trips() {
        let store = OAuthStore::open_in_memory().unwrap();
        let session = OAuthSession {
            session_id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            provider: "github-copilot".into(),
            user_id: None,
            created_at: 100,
            expires_at: 200,
            provider_uuid: None,
            error: None,
            pending_secret: Some("verifier".into()),
        };
        store.put_session(&session).await.unwrap();
        let fetched = store.get_session(session.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Pending);
        assert_eq!(fetched.pending_secret.as_deref(), Some("verifier"));
    }
}
