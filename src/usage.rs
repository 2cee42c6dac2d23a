//! Usage Recorder: append-only ledger, aggregation, time-series,
//! and daily roll-up.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageOutcome {
    Success,
    Error,
    Partial,
    Cancelled,
}

impl UsageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            UsageOutcome::Success => "success",
            UsageOutcome::Error => "error",
            UsageOutcome::Partial => "partial",
            UsageOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => UsageOutcome::Error,
            "partial" => UsageOutcome::Partial,
            "cancelled" => UsageOutcome::Cancelled,
            _ => UsageOutcome::Success,
        }
    }
}

pub struct NewUsageRecord {
    pub provider: Uuid,
    pub provider_name: String,
    pub model: String,
    pub scenario: String,
    pub rule: Uuid,
    pub request_model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status: UsageOutcome,
    pub error_code: Option<String>,
    pub latency_ms: u64,
    pub streamed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub provider: Uuid,
    pub provider_name: String,
    pub model: String,
    pub scenario: String,
    pub rule: Uuid,
    pub request_model: String,
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub status: UsageOutcome,
    pub error_code: Option<String>,
    pub latency_ms: u64,
    pub streamed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Model,
    Provider,
    Scenario,
    Rule,
    Daily,
    Hourly,
}

impl GroupBy {
    fn column_expr(&self) -> &'static str {
        match self {
            GroupBy::Model => "model",
            GroupBy::Provider => "provider_name",
            GroupBy::Scenario => "scenario",
            GroupBy::Rule => "rule",
            GroupBy::Daily => "date(timestamp)",
            GroupBy::Hourly => "strftime('%Y-%m-%d %H:00:00', timestamp)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    TotalTokens,
    RequestCount,
    AvgLatency,
}

impl SortKey {
    fn column_expr(&self) -> &'static str {
        match self {
            SortKey::TotalTokens => "total_tokens",
            SortKey::RequestCount => "request_count",
            SortKey::AvgLatency => "avg_latency",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "request_count" => SortKey::RequestCount,
            "avg_latency" => SortKey::AvgLatency,
            _ => SortKey::TotalTokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "asc" => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }
}

/// Optional time window and equality filters shared by `aggregate` and
/// `timeseries`.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub scenario: Option<String>,
    pub rule: Option<Uuid>,
    pub status: Option<UsageOutcome>,
}

impl UsageFilter {
    fn where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut conditions = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(since) = &self.since {
            conditions.push("timestamp >= ?".to_string());
            params.push(since.to_rfc3339().into());
        }
        if let Some(until) = &self.until {
            conditions.push("timestamp <= ?".to_string());
            params.push(until.to_rfc3339().into());
        }
        if let Some(provider) = &self.provider {
            conditions.push("provider_name = ?".to_string());
            params.push(provider.clone().into());
        }
        if let Some(model) = &self.model {
            conditions.push("model = ?".to_string());
            params.push(model.clone().into());
        }
        if let Some(scenario) = &self.scenario {
            conditions.push("scenario = ?".to_string());
            params.push(scenario.clone().into());
        }
        if let Some(rule) = &self.rule {
            conditions.push("rule = ?".to_string());
            params.push(rule.to_string().into());
        }
        if let Some(status) = &self.status {
            conditions.push("status = ?".to_string());
            params.push(status.as_str().into());
        }
        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), params)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub key: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub streamed_count: u64,
    pub streamed_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesBucket {
    pub bucket: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
}

pub struct UsageRecorder {
    conn: Arc<RwLock<Connection>>,
}

impl UsageRecorder {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening usage db {}", path.display()))?;
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
             CREATE TABLE IF NOT EXISTS usage_records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 provider TEXT NOT NULL,
                 provider_name TEXT NOT NULL,
                 model TEXT NOT NULL,
                 scenario TEXT NOT NULL,
                 rule TEXT NOT NULL,
                 request_model TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 input_tokens INTEGER NOT NULL,
                 output_tokens INTEGER NOT NULL,
                 total_tokens INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 error_code TEXT,
                 latency_ms INTEGER NOT NULL,
                 streamed INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp);
             CREATE INDEX IF NOT EXISTS idx_usage_provider ON usage_records(provider_name);
             CREATE TABLE IF NOT EXISTS usage_daily (
                 date TEXT NOT NULL,
                 provider_name TEXT NOT NULL,
                 model TEXT NOT NULL,
                 request_count INTEGER NOT NULL,
                 total_tokens INTEGER NOT NULL,
                 error_count INTEGER NOT NULL,
                 PRIMARY KEY (date, provider_name, model)
             );",
        )
        .context("creating usage schema")?;
        Ok(())
    }

    /// Completes synchronously; `total_tokens` is always recomputed.
    pub async fn record(&self, rec: NewUsageRecord) -> Result<(), crate::error::Error> {
        let total = rec.input_tokens + rec.output_tokens;
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO usage_records
             (provider, provider_name, model, scenario, rule, request_model, timestamp,
              input_tokens, output_tokens, total_tokens, status, error_code, latency_ms, streamed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                rec.provider.to_string(),
                rec.provider_name,
                rec.model,
                rec.scenario,
                rec.rule.to_string(),
                rec.request_model,
                Utc::now().to_rfc3339(),
                rec.input_tokens,
                rec.output_tokens,
                total,
                rec.status.as_str(),
                rec.error_code,
                rec.latency_ms,
                rec.streamed as i64,
            ],
        )
        .map_err(crate::error::Error::from)?;
        Ok(())
    }

    pub async fn aggregate(
        &self,
        group_by: GroupBy,
        filter: &UsageFilter,
        sort: SortKey,
        direction: SortDirection,
    ) -> Result<Vec<AggregateRow>> {
        let conn = self.conn.read().await;
        let expr = group_by.column_expr();
        let (where_clause, params) = filter.where_clause();
        let sql = format!(
            "SELECT {expr} AS k,
                    COUNT(*) AS request_count,
                    SUM(total_tokens) AS total_tokens,
                    AVG(input_tokens) AS avg_input,
                    AVG(output_tokens) AS avg_output,
                    AVG(latency_ms) AS avg_latency,
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS error_count,
                    SUM(CASE WHEN streamed = 1 THEN 1 ELSE 0 END) AS streamed_count
             FROM usage_records
             {where_clause}
             GROUP BY k
             ORDER BY {sort_col} {direction}",
            sort_col = sort.column_expr(),
            direction = direction.sql(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let request_count: u64 = row.get::<_, i64>(1)? as u64;
            let error_count: u64 = row.get::<_, i64>(6)? as u64;
            let streamed_count: u64 = row.get::<_, i64>(7)? as u64;
            Ok(AggregateRow {
                key: row.get(0)?,
                request_count,
                total_tokens: row.get::<_, i64>(2)? as u64,
                avg_input_tokens: row.get(3)?,
                avg_output_tokens: row.get(4)?,
                avg_latency_ms: row.get(5)?,
                error_count,
                error_rate: if request_count > 0 {
                    error_count as f64 / request_count as f64
                } else {
                    0.0
                },
                streamed_count,
                streamed_rate: if request_count > 0 {
                    streamed_count as f64 / request_count as f64
                } else {
                    0.0
                },
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("reading aggregate rows")
    }

    pub async fn timeseries(&self, interval: &str, filter: &UsageFilter) -> Result<Vec<TimeseriesBucket>> {
        let bucket_expr = match interval {
            "minute" => "strftime('%Y-%m-%d %H:%M:00', timestamp)",
            "day" => "date(timestamp)",
            "week" => "strftime('%Y-%W', timestamp)",
            _ => "strftime('%Y-%m-%d %H:00:00', timestamp)",
        };
        let conn = self.conn.read().await;
        let (where_clause, params) = filter.where_clause();
        let sql = format!(
            "SELECT {bucket_expr} AS bucket,
                    COUNT(*) AS request_count,
                    SUM(total_tokens) AS total_tokens,
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS error_count,
                    AVG(latency_ms) AS avg_latency
             FROM usage_records
             {where_clause}
             GROUP BY bucket
             ORDER BY bucket ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(TimeseriesBucket {
                bucket: row.get(0)?,
                request_count: row.get::<_, i64>(1)? as u64,
                total_tokens: row.get::<_, i64>(2)? as u64,
                error_count: row.get::<_, i64>(3)? as u64,
                avg_latency_ms: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("reading timeseries rows")
    }

    pub async fn raw(&self, limit: i64, offset: i64) -> Result<Vec<UsageRecord>> {
        let conn = self.conn.read().await;
        let mut stmt = conn.prepare(
            "SELECT id, provider, provider_name, model, scenario, rule, request_model,
                    timestamp, input_tokens, output_tokens, total_tokens, status,
                    error_code, latency_ms, streamed
             FROM usage_records ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| {
            let status: String = row.get(11)?;
            let provider: String = row.get(1)?;
            let rule: String = row.get(5)?;
            Ok(UsageRecord {
                id: row.get(0)?,
                provider: Uuid::parse_str(&provider).unwrap_or_default(),
                provider_name: row.get(2)?,
                model: row.get(3)?,
                scenario: row.get(4)?,
                rule: Uuid::parse_str(&rule).unwrap_or_default(),
                request_model: row.get(6)?,
                timestamp: row
                    .get::<_, String>(7)?
                    .parse()
                    .unwrap_or_else(|_| Utc::now()),
                input_tokens: row.get::<_, i64>(8)? as u64,
                output_tokens: row.get::<_, i64>(9)? as u64,
                total_tokens: row.get::<_, i64>(10)? as u64,
                status: UsageOutcome::parse(&status),
                error_code: row.get(12)?,
                latency_ms: row.get::<_, i64>(13)? as u64,
                streamed: row.get::<_, i64>(14)? != 0,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("reading raw usage rows")
    }

    /// Idempotent: collapses a date's per-request rows into
    /// `(date, provider, model)` summaries, replacing on conflict.
    pub async fn aggregate_to_daily(&self, date: &str) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO usage_daily (date, provider_name, model, request_count, total_tokens, error_count)
             SELECT date(timestamp), provider_name, model, COUNT(*), SUM(total_tokens),
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END)
             FROM usage_records
             WHERE date(timestamp) = ?1
             GROUP BY provider_name, model
             ON CONFLICT(date, provider_name, model) DO UPDATE SET
                 request_count = excluded.request_count,
                 total_tokens = excluded.total_tokens,
                 error_count = excluded.error_count",
            params![date],
        )?;
        Ok(())
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.write().await;
        let affected = conn.execute(
            "DELETE FROM usage_records WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: Uuid, rule: Uuid) -> NewUsageRecord {
        NewUsageRecord {
            provider,
            provider_name: "openai-main".into(),
            model: "gpt-4".into(),
            scenario: "openai".into(),
            rule,
            request_model: "gpt-4".into(),
            input_tokens: 10,
            output_tokens: 5,
            status: UsageOutcome::Success,
            error_code: None,
            latency_ms: 120,
            streamed: false,
        }
    }

    #[tokio::test]
    async fn total_tokens_invariant_holds() {
        let recorder = UsageRecorder::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        let rule = Uuid::new_v4();
        recorder.record(sample(provider, rule)).await.unwrap();
        let rows = recorder.raw(10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_tokens, rows[0].input_tokens + rows[0].output_tokens);
    }

    #[tokio::test]
    async fn aggregate_to_daily_is_idempotent() {
        let recorder = UsageRecorder::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        let rule = Uuid::new_v4();
        recorder.record(sample(provider, rule)).await.unwrap();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        recorder.aggregate_to_daily(&today).await.unwrap();
        recorder.aggregate_to_daily(&today).await.unwrap();

        let conn = recorder.conn.read().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM usage_daily", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn aggregate_by_provider_groups_correctly() {
        let recorder = UsageRecorder::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        let rule = Uuid::new_v4();
        recorder.record(sample(provider, rule)).await.unwrap();
        recorder.record(sample(provider, rule)).await.unwrap();
        let rows = recorder
            .aggregate(GroupBy::Provider, &UsageFilter::default(), SortKey::TotalTokens, SortDirection::Desc)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].total_tokens, 30);
    }

    #[tokio::test]
    async fn aggregate_filters_by_status() {
        let recorder = UsageRecorder::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        let rule = Uuid::new_v4();
        let mut failed = sample(provider, rule);
        failed.status = UsageOutcome::Error;
        recorder.record(sample(provider, rule)).await.unwrap();
        recorder.record(failed).await.unwrap();

        let filter = UsageFilter { status: Some(UsageOutcome::Error), ..Default::default() };
        let rows = recorder
            .aggregate(GroupBy::Provider, &filter, SortKey::TotalTokens, SortDirection::Desc)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 1);
        assert_eq!(rows[0].error_count, 1);
    }

    #[tokio::test]
    async fn timeseries_orders_buckets_chronologically() {
        let recorder = UsageRecorder::open_in_memory().unwrap();
        let provider = Uuid::new_v4();
        let rule = Uuid::new_v4();
        recorder.record(sample(provider, rule)).await.unwrap();
        let buckets = recorder.timeseries("day", &UsageFilter::default()).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].request_count, 1);
    }
}
