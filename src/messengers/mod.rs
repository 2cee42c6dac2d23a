//! IM Bot Framework Core: a platform-neutral `Bot` interface paired
//! with per-platform adapters that translate native events into canonical
//! messages, plus a `Manager` that owns connection lifecycle, reconnect
//! backoff, and handler dispatch across all registered bots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::retry::RetryPolicy;

#[cfg(feature = "messenger-discord")]
pub mod discord;
#[cfg(feature = "messenger-slack")]
pub mod slack;
#[cfg(feature = "messenger-telegram")]
pub mod telegram;
#[cfg(feature = "messenger-feishu")]
pub mod feishu;
#[cfg(feature = "messenger-whatsapp")]
pub mod whatsapp;
#[cfg(feature = "messenger-dingtalk")]
pub mod dingtalk;

// ── Canonical message model ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// Content kinds a native event can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Media(MediaAttachment),
    Reaction { target_message_id: String, emoji: String },
    System { kind: String, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub platform: String,
    pub channel: String,
    pub sender: String,
    pub content: Content,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub platform: String,
    pub name: String,
    pub max_text_len: usize,
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("transient error: {0}")]
    Retryable(String),
    #[error("authentication failed: {0}")]
    Fatal(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("media type not supported: {0}")]
    MediaNotSupported(String),
}

/// Receives canonical messages from a bot's receive loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, msg: Message, platform: &str);
}

/// Platform-neutral bot interface.
#[async_trait]
pub trait Bot: Send + Sync {
    async fn connect(&mut self) -> Result<(), BotError>;
    async fn disconnect(&mut self) -> Result<(), BotError>;

    async fn send_message(&self, target: &str, content: &Content) -> Result<String, BotError>;

    async fn send_text(&self, target: &str, text: &str) -> Result<String, BotError> {
        send_text_with_policy(self, target, text).await
    }

    async fn send_media(&self, target: &str, media: MediaAttachment) -> Result<String, BotError> {
        self.send_message(target, &Content::Media(media)).await
    }

    async fn react(&self, target_message_id: &str, emoji: &str) -> Result<(), BotError>;
    async fn edit_message(&self, message_ref: &str, text: &str) -> Result<(), BotError>;
    async fn delete_message(&self, message_ref: &str) -> Result<(), BotError>;

    fn platform_info(&self) -> PlatformInfo;
    fn status(&self) -> BotStatus;
    fn is_connected(&self) -> bool {
        self.status() == BotStatus::Connected
    }

    async fn start_receiving(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BotError>;
    async fn stop_receiving(&self) -> Result<(), BotError>;
}

/// `ValidateTextLength` + `ChunkText`: overlong text
/// is split on the platform's limit and sent as multiple messages; the
/// returned id is the last chunk's.
async fn send_text_with_policy(bot: &(impl Bot + ?Sized), target: &str, text: &str) -> Result<String, BotError> {
    let limit = bot.platform_info().max_text_len;
    let chunks = chunk_text(text, limit);
    let mut last_id = String::new();
    for chunk in chunks {
        last_id = bot.send_message(target, &Content::Text(chunk)).await?;
    }
    Ok(last_id)
}

/// Splits `text` into chunks no longer than `limit` chars, breaking on
/// whitespace where possible.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(' ') {
        if current.chars().count() + word.chars().count() > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if word.chars().count() > limit {
            for c in word.chars().collect::<Vec<_>>().chunks(limit) {
                chunks.push(c.iter().collect());
            }
            continue;
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ── Manager ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { auto_reconnect: true, max_reconnect_attempts: 5 }
    }
}

struct Handlers {
    on_connected: Vec<Arc<dyn Fn(&str) + Send + Sync>>,
    on_disconnected: Vec<Arc<dyn Fn(&str) + Send + Sync>>,
    on_message: Vec<Arc<dyn MessageHandler>>,
    on_error: Vec<Arc<dyn Fn(&str, &BotError) + Send + Sync>>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self { on_connected: Vec::new(), on_disconnected: Vec::new(), on_message: Vec::new(), on_error: Vec::new() }
    }
}

/// Owns a set of bots keyed by platform name.
pub struct Manager {
    bots: RwLock<HashMap<String, Box<dyn Bot>>>,
    handlers: RwLock<Handlers>,
    options: ManagerOptions,
    retry_policy: RetryPolicy,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: options_max_attempts(&options),
            ..RetryPolicy::http_default()
        };
        Self {
            bots: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Handlers::default()),
            options,
            retry_policy,
        }
    }

    pub async fn register(&self, platform: &str, bot: Box<dyn Bot>) {
        self.bots.write().await.insert(platform.to_string(), bot);
    }

    pub async fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.on_message.push(handler);
    }

    pub async fn on_connected(&self, handler: Arc<dyn Fn(&str) + Send + Sync>) {
        self.handlers.write().await.on_connected.push(handler);
    }

    pub async fn on_disconnected(&self, handler: Arc<dyn Fn(&str) + Send + Sync>) {
        self.handlers.write().await.on_disconnected.push(handler);
    }

    pub async fn on_error(&self, handler: Arc<dyn Fn(&str, &BotError) + Send + Sync>) {
        self.handlers.write().await.on_error.push(handler);
    }

    /// Connects every registered bot concurrently; failures are reported
    /// via `OnError` and, if `auto_reconnect` is set, retried in the
    /// background with exponential backoff up to `max_reconnect_attempts`.
    pub async fn start(self: &Arc<Self>) {
        let platforms: Vec<String> = self.bots.read().await.keys().cloned().collect();
        for platform in platforms {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.connect_with_retry(&platform).await;
            });
        }
    }

    async fn connect_with_retry(&self, platform: &str) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = {
                let mut bots = self.bots.write().await;
                match bots.get_mut(platform) {
                    Some(bot) => bot.connect().await,
                    None => return,
                }
            };
            match result {
                Ok(()) => {
                    self.emit_connected(platform).await;
                    return;
                }
                Err(err) => {
                    self.emit_error(platform, &err).await;
                    if !self.options.auto_reconnect || attempt >= self.options.max_reconnect_attempts {
                        return;
                    }
                    let delay = self.retry_policy.with_jitter(self.retry_policy.backoff_delay(attempt));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Disconnects every bot and drains handlers.
    pub async fn stop(&self) {
        let mut bots = self.bots.write().await;
        for (platform, bot) in bots.iter_mut() {
            if bot.disconnect().await.is_ok() {
                self.emit_disconnected(platform).await;
            }
        }
        let mut handlers = self.handlers.write().await;
        handlers.on_connected.clear();
        handlers.on_disconnected.clear();
        handlers.on_message.clear();
        handlers.on_error.clear();
    }

    pub async fn dispatch_message(&self, msg: Message, platform: &str) {
        let handlers = self.handlers.read().await.on_message.clone();
        for handler in handlers {
            let msg = msg.clone();
            let platform = platform.to_string();
            tokio::spawn(async move { handler.on_message(msg, &platform).await });
        }
    }

    async fn emit_connected(&self, platform: &str) {
        for h in &self.handlers.read().await.on_connected {
            h(platform);
        }
    }

    async fn emit_disconnected(&self, platform: &str) {
        for h in &self.handlers.read().await.on_disconnected {
            h(platform);
        }
    }

    async fn emit_error(&self, platform: &str, err: &BotError) {
        for h in &self.handlers.read().await.on_error {
            h(platform, err);
        }
    }
}

fn options_max_attempts(options: &ManagerOptions) -> u32 {
    options.max_reconnect_attempts.max(1)
}

pub fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("building messenger http client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_text_splits_on_word_boundaries_under_limit() {
        let chunks = chunk_text("hello world this is long", 11);
        assert!(chunks.iter().all(|c| c.chars().count() <= 11));
        assert_eq!(chunks.concat(), "hello world this is long");
    }

    #[test]
    fn chunk_text_passthrough_when_under_limit() {
        let chunks = chunk_text("short", 100);
        assert_eq!(chunks, vec!["short".to_string()]);
    }

    #[tokio::test]
    async fn manager_start_with_no_bots_is_a_noop() {
        let manager = Arc::new(Manager::new(ManagerOptions::default()));
        manager.start().await;
        manager.stop().await;
    }
}
