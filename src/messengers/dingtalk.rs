//! DingTalk custom robot webhook adapter with HMAC-SHA256 URL signing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::{Bot, BotError, BotStatus, Content, MessageHandler, PlatformInfo, default_http_client};

const DINGTALK_MAX_TEXT_LEN: usize = 20_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct DingTalkResponse {
    errcode: i32,
    errmsg: String,
}

pub struct DingTalkBot {
    name: String,
    webhook_url: String,
    secret: String,
    http: reqwest::Client,
    status: Arc<AtomicU8>,
}

impl DingTalkBot {
    pub fn new(name: String, webhook_url: String, secret: String) -> Self {
        Self {
            name,
            webhook_url,
            secret,
            http: default_http_client(),
            status: Arc::new(AtomicU8::new(BotStatus::Disconnected as u8)),
        }
    }

    /// DingTalk's webhook signing scheme: sign `"{timestamp}\n{secret}"`
    /// with HMAC-SHA256 keyed by the secret, then URL-encode the base64
    /// digest into `&timestamp=...&sign=...`.
    fn signed_url(&self, timestamp: i64) -> Result<String, BotError> {
        let base = format!("{timestamp}\n{}", self.secret);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BotError::Fatal(e.to_string()))?;
        mac.update(base.as_bytes());
        let sign = BASE64.encode(mac.finalize().into_bytes());
        Ok(format!(
            "{}&timestamp={timestamp}&sign={}",
            self.webhook_url,
            urlencoding_encode(&sign)
        ))
    }

    fn set_status(&self, status: BotStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

fn urlencoding_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[async_trait]
impl Bot for DingTalkBot {
    async fn connect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Disconnected);
        Ok(())
    }

    async fn send_message(&self, _target: &str, content: &Content) -> Result<String, BotError> {
        let text = match content {
            Content::Text(t) => t.clone(),
            Content::Media(m) => m.url.clone().ok_or_else(|| BotError::MediaNotSupported("media without url".into()))?,
            Content::Reaction { .. } => return Err(BotError::MediaNotSupported("reactions not supported".into())),
            Content::System { detail, .. } => detail.clone(),
        };
        let timestamp = Utc::now().timestamp_millis();
        let url = self.signed_url(timestamp)?;
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "msgtype": "text", "text": { "content": text } }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: DingTalkResponse = resp.json().await.map_err(|e| BotError::Retryable(e.to_string()))?;
        if body.errcode != 0 {
            return Err(BotError::Retryable(body.errmsg));
        }
        Ok(timestamp.to_string())
    }

    async fn react(&self, _target_message_id: &str, _emoji: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("dingtalk webhook bots cannot react".into()))
    }

    async fn edit_message(&self, _message_ref: &str, _text: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("dingtalk webhook bots cannot edit".into()))
    }

    async fn delete_message(&self, _message_ref: &str) -> Result<(), BotError> {
        Err(BotError::MediaNotSupported("dingtalk webhook bots cannot delete".into()))
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo { platform: "dingtalk".into(), name: self.name.clone(), max_text_len: DINGTALK_MAX_TEXT_LEN }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_encode_escapes_base64_padding() {
        assert_eq!(urlencoding_encode("a+b/c="), "a%2Bb%2Fc%3D");
    }

    #[test]
    fn signed_url_embeds_timestamp_and_sign_params() {
        let bot = DingTalkBot::new("primary".into(), "https://oapi.dingtalk.com/robot/send?access_token=x".into(), "secret".into());
        let url = bot.signed_url(1700000000000).unwrap();
        assert!(url.contains("timestamp=1700000000000"));
        assert!(url.contains("sign="));
    }
}
