//! Telegram adapter using the Bot API's long-poll `getUpdates`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{Bot, BotError, BotStatus, Content, Message, MessageHandler, PlatformInfo, default_http_client};

const TELEGRAM_MAX_TEXT_LEN: usize = 4096;

#[derive(Deserialize)]
struct GetMeResponse {
    ok: bool,
}

#[derive(Deserialize)]
struct SendMessageResponse {
    ok: bool,
    result: Option<TelegramMessageResult>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct TelegramMessageResult {
    message_id: i64,
}

#[derive(Deserialize)]
struct GetUpdatesResponse {
    result: Vec<TelegramUpdate>,
}

#[derive(Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramIncomingMessage>,
}

#[derive(Deserialize)]
struct TelegramIncomingMessage {
    message_id: i64,
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
    date: i64,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
}

pub struct TelegramBot {
    name: String,
    bot_token: String,
    http: reqwest::Client,
    status: Arc<AtomicU8>,
    last_update_id: Arc<AtomicI64>,
    receiving: Arc<RwLock<bool>>,
}

impl TelegramBot {
    pub fn new(name: String, bot_token: String) -> Self {
        Self {
            name,
            bot_token,
            http: default_http_client(),
            status: Arc::new(AtomicU8::new(BotStatus::Disconnected as u8)),
            last_update_id: Arc::new(AtomicI64::new(0)),
            receiving: Arc::new(RwLock::new(false)),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }

    fn set_status(&self, status: BotStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bot for TelegramBot {
    async fn connect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Connecting);
        let resp = self
            .http
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: GetMeResponse = resp.json().await.map_err(|e| BotError::Fatal(e.to_string()))?;
        if !body.ok {
            self.set_status(BotStatus::Disconnected);
            return Err(BotError::Fatal("telegram getMe returned ok=false".into()));
        }
        self.set_status(BotStatus::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BotError> {
        *self.receiving.write().await = false;
        self.set_status(BotStatus::Disconnected);
        Ok(())
    }

    async fn send_message(&self, target: &str, content: &Content) -> Result<String, BotError> {
        let text = match content {
            Content::Text(t) => t.clone(),
            Content::Media(m) => m.url.clone().ok_or_else(|| BotError::MediaNotSupported("media without url".into()))?,
            Content::Reaction { .. } => return Err(BotError::MediaNotSupported("reactions not supported".into())),
            Content::System { detail, .. } => detail.clone(),
        };
        let resp = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": target, "text": text }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: SendMessageResponse = resp.json().await.map_err(|e| BotError::Retryable(e.to_string()))?;
        if !body.ok {
            return Err(BotError::Retryable(body.description.unwrap_or_else(|| "send failed".into())));
        }
        Ok(body
            .result
            .map(|r| r.message_id.to_string())
            .unwrap_or_default())
    }

    async fn react(&self, _target_message_id: &str, _emoji: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("telegram reactions not implemented".into()))
    }

    async fn edit_message(&self, message_ref: &str, text: &str) -> Result<(), BotError> {
        let (chat_id, message_id) = split_ref(message_ref)?;
        self.http
            .post(self.api_url("editMessageText"))
            .json(&serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        Ok(())
    }

    async fn delete_message(&self, message_ref: &str) -> Result<(), BotError> {
        let (chat_id, message_id) = split_ref(message_ref)?;
        self.http
            .post(self.api_url("deleteMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "message_id": message_id }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        Ok(())
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo { platform: "telegram".into(), name: self.name.clone(), max_text_len: TELEGRAM_MAX_TEXT_LEN }
    }

    fn status(&self) -> BotStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => BotStatus::Disconnected,
            1 => BotStatus::Connecting,
            2 => BotStatus::Connected,
            _ => BotStatus::Reconnecting,
        }
    }

    async fn start_receiving(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BotError> {
        *self.receiving.write().await = true;
        let http = self.http.clone();
        let url = self.api_url("getUpdates");
        let last_update_id = Arc::clone(&self.last_update_id);
        let receiving = Arc::clone(&self.receiving);
        tokio::spawn(async move {
            while *receiving.read().await {
                let offset = last_update_id.load(Ordering::SeqCst) + 1;
                let resp = http
                    .get(&url)
                    .query(&[("timeout", "30"), ("offset", &offset.to_string())])
                    .send()
                    .await;
                let Ok(resp) = resp else { continue };
                let Ok(body) = resp.json::<GetUpdatesResponse>().await else { continue };
                for update in body.result {
                    last_update_id.store(update.update_id, Ordering::SeqCst);
                    if let Some(msg) = update.message {
                        let canonical = Message {
                            id: msg.message_id.to_string(),
                            platform: "telegram".into(),
                            channel: msg.chat.id.to_string(),
                            sender: msg.from.map(|u| u.id.to_string()).unwrap_or_default(),
                            content: msg.text.map(Content::Text).unwrap_or(Content::System {
                                kind: "unknown".into(),
                                detail: "unsupported telegram message type".into(),
                            }),
                            reply_to: None,
                            timestamp: chrono::DateTime::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
                        };
                        handler.on_message(canonical, "telegram").await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), BotError> {
        *self.receiving.write().await = false;
        Ok(())
    }
}

fn split_ref(message_ref: &str) -> Result<(&str, &str), BotError> {
    message_ref
        .split_once(':')
        .ok_or_else(|| BotError::InvalidTarget(format!("expected chat_id:message_id, got {message_ref}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ref_parses_composite_reference() {
        assert_eq!(split_ref("123:456").unwrap(), ("123", "456"));
    }

    #[test]
    fn split_ref_rejects_bare_id() {
        assert!(split_ref("123").is_err());
    }

    #[test]
    fn platform_info_reports_telegram_text_limit() {
        let bot = TelegramBot::new("primary".into(), "token".into());
        assert_eq!(bot.platform_info().max_text_len, TELEGRAM_MAX_TEXT_LEN);
        assert_eq!(bot.status(), BotStatus::Disconnected);
    }
}
