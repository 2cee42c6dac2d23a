//! WebChat Relay: a WebSocket hub mounted on `warp::ws`, backed by a
//! SQLite message/session store and a bounded in-memory cache. Connections
//! are split into a writer task draining a bounded channel and a reader
//! loop with idle-timeout/ping liveness checks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;
use warp::Filter;
use warp::ws::{Message as WsMessage, WebSocket};

const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_CHANNEL_DEPTH: usize = 256;
const HISTORY_REPLAY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum WebChatError {
    #[error("send buffer full")]
    SendBufferFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub connect_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── SQLite-backed store ──────────────────────────────────────────────────

pub struct Store {
    conn: Arc<RwLock<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening webchat db {}", path.display()))?;
        Self::init(&conn)?;
        Ok(Self { conn: Arc::new(RwLock::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Arc::new(RwLock::new(conn)) })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS messages (
                 id TEXT PRIMARY KEY,
                 session_id TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 sender_id TEXT NOT NULL,
                 sender_name TEXT NOT NULL,
                 text TEXT NOT NULL,
                 media TEXT,
                 metadata TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp);
             CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 sender_id TEXT NOT NULL,
                 sender_name TEXT NOT NULL,
                 user_agent TEXT,
                 ip TEXT,
                 connect_time TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    pub async fn insert_message(&self, msg: &ChatMessage) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO messages (id, session_id, timestamp, sender_id, sender_name, text, media, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id.to_string(),
                msg.session_id.to_string(),
                msg.timestamp.to_rfc3339(),
                msg.sender_id,
                msg.sender_name,
                msg.text,
                msg.media,
                msg.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_session(&self, info: &SessionInfo) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute(
            "INSERT INTO sessions (id, sender_id, sender_name, user_agent, ip, connect_time, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 sender_id = excluded.sender_id,
                 sender_name = excluded.sender_name,
                 user_agent = excluded.user_agent,
                 ip = excluded.ip,
                 updated_at = excluded.updated_at",
            params![
                info.id.to_string(),
                info.sender_id,
                info.sender_name,
                info.user_agent,
                info.ip,
                info.connect_time.to_rfc3339(),
                info.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// `ORDER BY timestamp DESC LIMIT ? OFFSET ?`.
    pub async fn history(&self, session_id: Uuid, limit: usize, offset: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.read().await;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, timestamp, sender_id, sender_name, text, media, metadata
             FROM messages WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![session_id.to_string(), limit as i64, offset as i64], map_message_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let conn = self.conn.read().await;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, sender_name, user_agent, ip, connect_time, updated_at FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], map_session_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionInfo>> {
        let conn = self.conn.read().await;
        Ok(conn
            .query_row(
                "SELECT id, sender_id, sender_name, user_agent, ip, connect_time, updated_at FROM sessions WHERE id = ?1",
                params![id.to_string()],
                map_session_row,
            )
            .ok())
    }
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<ChatMessage> {
    let metadata: String = row.get(7)?;
    Ok(ChatMessage {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        session_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        timestamp: parse_dt(row.get::<_, String>(2)?),
        sender_id: row.get(3)?,
        sender_name: row.get(4)?,
        text: row.get(5)?,
        media: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<SessionInfo> {
    Ok(SessionInfo {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        sender_id: row.get(1)?,
        sender_name: row.get(2)?,
        user_agent: row.get(3)?,
        ip: row.get(4)?,
        connect_time: parse_dt(row.get::<_, String>(5)?),
        updated_at: parse_dt(row.get::<_, String>(6)?),
    })
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

// ── In-memory cache ──────────────────────────────────────────────────────

struct SessionCache {
    max_size: usize,
    entries: HashMap<Uuid, VecDeque<ChatMessage>>,
}

impl SessionCache {
    fn new(max_size: usize) -> Self {
        Self { max_size, entries: HashMap::new() }
    }

    fn push(&mut self, msg: ChatMessage) {
        let deque = self.entries.entry(msg.session_id).or_default();
        deque.push_front(msg);
        while deque.len() > self.max_size {
            deque.pop_back();
        }
    }

    /// Returns a defensive copy of up to `n` newest-first messages.
    fn get(&self, session_id: Uuid, n: usize) -> Vec<ChatMessage> {
        self.entries
            .get(&session_id)
            .map(|d| d.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }

    fn prune_old(&mut self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        self.entries.retain(|_, deque| {
            deque.retain(|m| m.timestamp >= cutoff);
            !deque.is_empty()
        });
    }
}

/// Registered bot handler fan-out target.
#[async_trait::async_trait]
pub trait BotHandler: Send + Sync {
    async fn on_join(&self, session: &SessionInfo);
    async fn on_leave(&self, session_id: Uuid);
    async fn on_message(&self, msg: &ChatMessage);
}

/// Fans out hub events to an externally registered bot's webhook
/// (`POST /api/bot/register`).
pub struct WebhookBotHandler {
    http: reqwest::Client,
    bot_id: String,
    callback_url: String,
}

impl WebhookBotHandler {
    fn new(bot_id: String, callback_url: String) -> Self {
        Self { http: reqwest::Client::new(), bot_id, callback_url }
    }

    async fn post(&self, event: &str, payload: serde_json::Value) {
        let _ = self
            .http
            .post(&self.callback_url)
            .json(&json!({ "event": event, "bot_id": self.bot_id, "payload": payload }))
            .send()
            .await;
    }
}

#[async_trait::async_trait]
impl BotHandler for WebhookBotHandler {
    async fn on_join(&self, session: &SessionInfo) {
        self.post("join", serde_json::to_value(session).unwrap_or_default()).await;
    }
    async fn on_leave(&self, session_id: Uuid) {
        self.post("leave", json!({ "session_id": session_id })).await;
    }
    async fn on_message(&self, msg: &ChatMessage) {
        self.post("message", serde_json::to_value(msg).unwrap_or_default()).await;
    }
}

struct OutboundSession {
    tx: mpsc::Sender<WsMessage>,
}

/// Owns sessions, the cache, the store, and registered bot handlers.
pub struct Hub {
    store: Arc<Store>,
    cache: RwLock<SessionCache>,
    outbound: RwLock<HashMap<Uuid, OutboundSession>>,
    bots: RwLock<Vec<Arc<dyn BotHandler>>>,
    bot_ids: RwLock<HashSet<String>>,
}

impl Hub {
    pub fn new(store: Arc<Store>, cache_size: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache: RwLock::new(SessionCache::new(cache_size)),
            outbound: RwLock::new(HashMap::new()),
            bots: RwLock::new(Vec::new()),
            bot_ids: RwLock::new(HashSet::new()),
        })
    }

    pub async fn register_bot(&self, handler: Arc<dyn BotHandler>) {
        self.bots.write().await.push(handler);
    }

    async fn register_webhook_bot(&self, bot_id: String, callback_url: String) {
        self.bot_ids.write().await.insert(bot_id.clone());
        self.register_bot(Arc::new(WebhookBotHandler::new(bot_id, callback_url))).await;
    }

    async fn is_registered_bot(&self, bot_id: &str) -> bool {
        self.bot_ids.read().await.contains(bot_id)
    }

    /// A registered bot pushes a message into a session via `POST
    /// /api/bot/:botid/send`: persisted, cached, and forwarded to the
    /// session's live socket if connected.
    async fn bot_send(&self, bot_id: &str, session_id: Uuid, text: &str) -> Result<(), WebChatError> {
        let msg = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            timestamp: Utc::now(),
            sender_id: bot_id.to_string(),
            sender_name: bot_id.to_string(),
            text: text.to_string(),
            media: None,
            metadata: serde_json::Value::Null,
        };
        let _ = self.store.insert_message(&msg).await;
        self.cache.write().await.push(msg.clone());
        if let Ok(json) = serde_json::to_string(&msg) {
            self.send(session_id, WsMessage::text(json)).await?;
        }
        Ok(())
    }

    /// Sends to a session's outbound channel; returns `SendBufferFull` on
    /// backpressure rather than blocking.
    pub async fn send(&self, session_id: Uuid, msg: WsMessage) -> Result<(), WebChatError> {
        let outbound = self.outbound.read().await;
        let Some(session) = outbound.get(&session_id) else {
            return Ok(());
        };
        session.tx.try_send(msg).map_err(|_| WebChatError::SendBufferFull)
    }

    async fn history_for_new_connection(&self, session_id: Uuid) -> Vec<ChatMessage> {
        let cached = self.cache.read().await.get(session_id, HISTORY_REPLAY_LIMIT);
        if !cached.is_empty() {
            return cached;
        }
        self.store
            .history(session_id, HISTORY_REPLAY_LIMIT, 0)
            .await
            .unwrap_or_default()
    }
}

// ── warp routes ──────────────────────────────────────────────────────────

pub fn routes(hub: Arc<Hub>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_hub = warp::any().map(move || Arc::clone(&hub));

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_hub.clone())
        .map(|ws: warp::ws::Ws, params: HashMap<String, String>, hub: Arc<Hub>| {
            let session_id = params
                .get("session_id")
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4);
            ws.on_upgrade(move |socket| handle_socket(socket, session_id, hub))
        });

    #[derive(Deserialize)]
    struct RegisterBody {
        bot_id: String,
        callback_url: String,
    }
    let register_route = warp::path!("api" / "bot" / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_hub.clone())
        .and_then(|body: RegisterBody, hub: Arc<Hub>| async move {
            hub.register_webhook_bot(body.bot_id, body.callback_url).await;
            Ok::<_, Infallible>(warp::reply::json(&json!({ "ok": true })))
        });

    #[derive(Deserialize)]
    struct SendBody {
        session_id: Uuid,
        text: String,
    }
    let bot_send_route = warp::path!("api" / "bot" / String / "send")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_hub.clone())
        .and_then(|bot_id: String, body: SendBody, hub: Arc<Hub>| async move {
            if !hub.is_registered_bot(&bot_id).await {
                return Ok::<_, Infallible>(Box::new(warp::reply::with_status(
                    warp::reply::json(&json!({ "error": "unknown bot_id" })),
                    warp::http::StatusCode::NOT_FOUND,
                )) as Box<dyn warp::Reply>);
            }
            match hub.bot_send(&bot_id, body.session_id, &body.text).await {
                Ok(()) => Ok(Box::new(warp::reply::json(&json!({ "ok": true }))) as Box<dyn warp::Reply>),
                Err(_) => Ok(Box::new(warp::reply::with_status(
                    warp::reply::json(&json!({ "error": "send buffer full" })),
                    warp::http::StatusCode::TOO_MANY_REQUESTS,
                )) as Box<dyn warp::Reply>),
            }
        });

    let sessions_route = warp::path!("api" / "sessions")
        .and(warp::get())
        .and(with_hub.clone())
        .and_then(|hub: Arc<Hub>| async move {
            let sessions = hub.store.list_sessions().await.unwrap_or_default();
            Ok::<_, Infallible>(warp::reply::json(&sessions))
        });

    let session_detail_route = warp::path!("api" / "sessions" / Uuid)
        .and(warp::get())
        .and(with_hub.clone())
        .and_then(|id: Uuid, hub: Arc<Hub>| async move {
            match hub.store.get_session(id).await.ok().flatten() {
                Some(session) => Ok::<_, Infallible>(Box::new(warp::reply::json(&session)) as Box<dyn warp::Reply>),
                None => Ok(Box::new(warp::reply::with_status(
                    warp::reply::json(&json!({ "error": "session not found" })),
                    warp::http::StatusCode::NOT_FOUND,
                )) as Box<dyn warp::Reply>),
            }
        });

    let health_route = warp::path!("api" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "status": "ok" })));

    ws_route
        .or(register_route)
        .or(bot_send_route)
        .or(sessions_route)
        .or(session_detail_route)
        .or(health_route)
}

async fn handle_socket(ws: WebSocket, session_id: Uuid, hub: Arc<Hub>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(WRITE_CHANNEL_DEPTH);
    hub.outbound.write().await.insert(session_id, OutboundSession { tx: tx.clone() });

    let now = Utc::now();
    let session = SessionInfo {
        id: session_id,
        sender_id: session_id.to_string(),
        sender_name: "web".into(),
        user_agent: None,
        ip: None,
        connect_time: now,
        updated_at: now,
    };
    let _ = hub.store.upsert_session(&session).await;
    for bot in hub.bots.read().await.iter() {
        bot.on_join(&session).await;
    }

    for msg in hub.history_for_new_connection(session_id).await.into_iter().rev() {
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = tx.try_send(WsMessage::text(json));
        }
    }

    // Write loop: drains the bounded channel to the socket; on close,
    // drains to a close-message and closes the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(WsMessage::close()).await;
    });

    // Read loop: 60s idle deadline, ping every 30s.
    loop {
        let next = tokio::time::timeout(READ_IDLE_TIMEOUT, ws_rx.next());
        let frame = tokio::select! {
            result = next => result,
            _ = tokio::time::sleep(PING_INTERVAL) => {
                if tx.try_send(WsMessage::ping(Vec::new())).is_err() {
                    break;
                }
                continue;
            }
        };
        let Ok(Some(Ok(msg))) = frame else { break };

        if msg.is_close() {
            break;
        }
        if msg.is_pong() {
            continue;
        }
        if !msg.is_text() {
            continue;
        }

        let Ok(mut parsed) = serde_json::from_str::<ChatMessage>(msg.to_str().unwrap_or_default()) else {
            continue;
        };
        parsed.session_id = session_id;
        let _ = hub.store.insert_message(&parsed).await;
        hub.cache.write().await.push(parsed.clone());
        for bot in hub.bots.read().await.iter() {
            bot.on_message(&parsed).await;
        }
    }

    hub.outbound.write().await.remove(&session_id);
    for bot in hub.bots.read().await.iter() {
        bot.on_leave(session_id).await;
    }
    writer.abort();
}

/// Periodically evicts cache entries older than `max_age`.
pub async fn run_cache_prune_loop(hub: Arc<Hub>, interval: Duration, max_age: chrono::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        hub.cache.write().await.prune_old(max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(session_id: Uuid, text: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            timestamp: Utc::now(),
            sender_id: "u1".into(),
            sender_name: "alice".into(),
            text: text.into(),
            media: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn store_roundtrips_message_history_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let session_id = Uuid::new_v4();
        store.insert_message(&sample_message(session_id, "hi")).await.unwrap();
        store.insert_message(&sample_message(session_id, "there")).await.unwrap();
        let history = store.history(session_id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "there");
    }

    #[test]
    fn cache_evicts_beyond_max_size() {
        let mut cache = SessionCache::new(2);
        let session_id = Uuid::new_v4();
        cache.push(sample_message(session_id, "a"));
        cache.push(sample_message(session_id, "b"));
        cache.push(sample_message(session_id, "c"));
        let all = cache.get(session_id, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "c");
    }

    #[test]
    fn cache_prune_old_evicts_empty_sessions() {
        let mut cache = SessionCache::new(10);
        let session_id = Uuid::new_v4();
        let mut old = sample_message(session_id, "stale");
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        cache.push(old);
        cache.prune_old(chrono::Duration::hours(1));
        assert!(cache.get(session_id, 10).is_empty());
    }
}
