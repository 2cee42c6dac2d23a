//! Model Capability Store: per-model endpoint capability with a
//! freshness window. Grounded on `rules::store`'s SQLite idiom.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Chat,
    Responses,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRecord {
    pub provider: Uuid,
    pub model: String,
    pub endpoint: EndpointType,
    pub available: bool,
    pub latency_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEndpointCapability {
    pub provider: Uuid,
    pub model: String,
    pub preferred_endpoint: Option<EndpointType>,
    pub records: Vec<CapabilityRecord>,
}

pub struct CapabilityStore {
    conn: Arc<RwLock<Connection>>,
}

impl CapabilityStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening capability db {}", path.display()))?;
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
             CREATE TABLE IF NOT EXISTS capabilities (
                 provider TEXT NOT NULL,
                 model TEXT NOT NULL,
                 endpoint TEXT NOT NULL,
                 available INTEGER NOT NULL,
                 latency_ms INTEGER,
                 last_checked TEXT NOT NULL,
                 error TEXT,
                 PRIMARY KEY (provider, model, endpoint)
             );",
        )
        .context("creating capabilities schema")?;
        Ok(())
    }

    pub async fn record(
        &self,
        provider: Uuid,
        model: &str,
        endpoint: EndpointType,
        available: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO capabilities (provider, model, endpoint, available, latency_ms, last_checked, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(provider, model, endpoint) DO UPDATE SET
                 available = excluded.available,
                 latency_ms = excluded.latency_ms,
                 last_checked = excluded.last_checked,
                 error = excluded.error",
            params![
                provider.to_string(),
                model,
                endpoint.to_string(),
                available,
                latency_ms,
                Utc::now().to_rfc3339(),
                error,
            ],
        )?;
        Ok(())
    }

    /// Aggregates both endpoint records for `(provider, model)`, preferring
    /// `responses` when available, else `chat`.
    pub async fn get(&self, provider: Uuid, model: &str) -> Result<ModelEndpointCapability> {
        let conn = self.conn.read().await;
        let mut stmt = conn.prepare(
            "SELECT endpoint, available, latency_ms, last_checked, error
             FROM capabilities WHERE provider = ?1 AND model = ?2",
        )?;
        let rows = stmt.query_map(params![provider.to_string(), model], |r| {
            let endpoint: String = r.get(0)?;
            let last_checked: String = r.get(3)?;
            Ok((endpoint, r.get::<_, bool>(1)?, r.get::<_, Option<u64>>(2)?, last_checked, r.get::<_, Option<String>>(4)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (endpoint_str, available, latency_ms, last_checked, error) = row?;
            let Ok(endpoint) = endpoint_str.parse::<EndpointType>() else {
                continue;
            };
            let last_checked = DateTime::parse_from_rfc3339(&last_checked)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            records.push(CapabilityRecord {
                provider,
                model: model.to_string(),
                endpoint,
                available,
                latency_ms,
                last_checked,
                error,
            });
        }

        let preferred_endpoint = records
            .iter()
            .find(|r| r.endpoint == EndpointType::Responses && r.available)
            .or_else(|| records.iter().find(|r| r.endpoint == EndpointType::Chat && r.available))
            .map(|r| r.endpoint);

        Ok(ModelEndpointCapability {
            provider,
            model: model.to_string(),
            preferred_endpoint,
            records,
        })
    }

    /// True when there's no record, or every record predates `max_age`.
    pub async fn is_stale(&self, provider: Uuid, model: &str, max_age: chrono::Duration) -> Result<bool> {
        let capability = self.get(provider, model).await?;
        if capability.records.is_empty() {
            return Ok(true);
        }
        let cutoff = Utc::now() - max_age;
        Ok(capability.records.iter().all(|r| r.last_checked < cutoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefers_responses_endpoint_when_both_available() {
        let store = CapabilityStore::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        store.record(provider, "gpt-4o", EndpointType::Chat, true, Some(100), None).await.unwrap();
        store.record(provider, "gpt-4o", EndpointType::Responses, true, Some(80), None).await.unwrap();
        let capability = store.get(provider, "gpt-4o").await.unwrap();
        assert_eq!(capability.preferred_endpoint, Some(EndpointType::Responses));
    }

    #[tokio::test]
    async fn falls_back_to_chat_when_responses_unavailable() {
        let store = CapabilityStore::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        store.record(provider, "gpt-4o", EndpointType::Chat, true, Some(100), None).await.unwrap();
        store.record(provider, "gpt-4o", EndpointType::Responses, false, None, Some("404".into())).await.unwrap();
        let capability = store.get(provider, "gpt-4o").await.unwrap();
        assert_eq!(capability.preferred_endpoint, Some(EndpointType::Chat));
    }

    #[tokio::test]
    async fn no_record_is_always_stale() {
        let store = CapabilityStore::open_in_memory().unwrap();
        let stale = store.is_stale(Uuid::new_v4(), "missing", chrono::Duration::hours(1)).await.unwrap();
        assert!(stale);
    }
}
