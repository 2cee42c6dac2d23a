//! Rule current-service pointer persistence.
//!
//! Single row per rule UUID, using the same `Arc<RwLock<Connection>>` +
//! `execute_batch` schema idiom as the rest of this crate's SQLite-backed
//! stores.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct RuleStateStore {
    conn: Arc<RwLock<Connection>>,
}

impl RuleStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening rule state db {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS rule_state (
                 rule_id TEXT PRIMARY KEY,
                 current_service TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )
        .context("creating rule_state schema")?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rule_state (
                 rule_id TEXT PRIMARY KEY,
                 current_service TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    /// `value` is `"provider_uuid:model"`.
    pub async fn set_pointer(&self, rule_id: Uuid, value: &str) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO rule_state (rule_id, current_service, updated_at)
             VALUES (?1, ?2, strftime('%s','now'))
             ON CONFLICT(rule_id) DO UPDATE SET
                 current_service = excluded.current_service,
                 updated_at = excluded.updated_at",
            params![rule_id.to_string(), value],
        )?;
        Ok(())
    }

    pub async fn get_pointer(&self, rule_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.read().await;
        let result = conn
            .query_row(
                "SELECT current_service FROM rule_state WHERE rule_id = ?1",
                params![rule_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .ok();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pointer_round_trips() {
        let store = RuleStateStore::open_in_memory().unwrap();
        let rule_id = Uuid::new_v4();
        assert_eq!(store.get_pointer(rule_id).await.unwrap(), None);
        store.set_pointer(rule_id, "p1:m1").await.unwrap();
        assert_eq!(store.get_pointer(rule_id).await.unwrap(), Some("p1:m1".into()));
        store.set_pointer(rule_id, "p2:m2").await.unwrap();
        assert_eq!(store.get_pointer(rule_id).await.unwrap(), Some("p2:m2".into()));
    }
}
