//! WhatsApp Cloud API adapter (Meta Business Platform).

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use super::{Bot, BotError, BotStatus, Content, MessageHandler, PlatformInfo, default_http_client};

const WHATSAPP_MAX_TEXT_LEN: usize = 4096;

#[derive(Deserialize)]
struct WhatsAppSendResponse {
    messages: Option<Vec<WhatsAppMessageId>>,
    error: Option<WhatsAppError>,
}

#[derive(Deserialize)]
struct WhatsAppMessageId {
    id: String,
}

#[derive(Deserialize)]
struct WhatsAppError {
    message: String,
}

pub struct WhatsAppBot {
    name: String,
    phone_number_id: String,
    access_token: String,
    http: reqwest::Client,
    status: Arc<AtomicU8>,
}

impl WhatsAppBot {
    pub fn new(name: String, phone_number_id: String, access_token: String) -> Self {
        Self {
            name,
            phone_number_id,
            access_token,
            http: default_http_client(),
            status: Arc::new(AtomicU8::new(BotStatus::Disconnected as u8)),
        }
    }

    fn api_url(&self) -> String {
        format!("https://graph.facebook.com/v20.0/{}/messages", self.phone_number_id)
    }

    fn set_status(&self, status: BotStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bot for WhatsAppBot {
    async fn connect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Disconnected);
        Ok(())
    }

    async fn send_message(&self, target: &str, content: &Content) -> Result<String, BotError> {
        let payload = match content {
            Content::Text(t) => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": target,
                "type": "text",
                "text": { "body": t },
            }),
            Content::Media(m) => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": target,
                "type": "image",
                "image": { "link": m.url.clone().ok_or_else(|| BotError::MediaNotSupported("media without url".into()))? },
            }),
            Content::Reaction { target_message_id, emoji } => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": target,
                "type": "reaction",
                "reaction": { "message_id": target_message_id, "emoji": emoji },
            }),
            Content::System { detail, .. } => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": target,
                "type": "text",
                "text": { "body": detail },
            }),
        };
        let resp = self
            .http
            .post(self.api_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: WhatsAppSendResponse = resp.json().await.map_err(|e| BotError::Retryable(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(BotError::Retryable(err.message));
        }
        Ok(body
            .messages
            .and_then(|m| m.into_iter().next())
            .map(|m| m.id)
            .unwrap_or_default())
    }

    async fn react(&self, target_message_id: &str, emoji: &str) -> Result<(), BotError> {
        self.send_message(target_message_id, &Content::Reaction {
            target_message_id: target_message_id.to_string(),
            emoji: emoji.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn edit_message(&self, _message_ref: &str, _text: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("whatsapp does not support message edits".into()))
    }

    async fn delete_message(&self, _message_ref: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("whatsapp does not support message deletes".into()))
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo { platform: "whatsapp".into(), name: self.name.clone(), max_text_len: WHATSAPP_MAX_TEXT_LEN }
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
        let _ = handler;
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), BotError> {
        Ok(())
    }
}
