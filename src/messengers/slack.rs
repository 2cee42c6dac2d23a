//! Slack adapter using the Web API for sends and signing-secret
//! verification for inbound Events API callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::{Bot, BotError, BotStatus, Content, MessageHandler, PlatformInfo, default_http_client};

const SLACK_API_BASE: &str = "https://slack.com/api";
const SLACK_MAX_TEXT_LEN: usize = 40_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct SlackPostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

pub struct SlackBot {
    name: String,
    bot_token: String,
    signing_secret: String,
    http: reqwest::Client,
    status: Arc<AtomicU8>,
}

impl SlackBot {
    pub fn new(name: String, bot_token: String, signing_secret: String) -> Self {
        Self {
            name,
            bot_token,
            signing_secret,
            http: default_http_client(),
            status: Arc::new(AtomicU8::new(BotStatus::Disconnected as u8)),
        }
    }

    fn set_status(&self, status: BotStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Verifies the `X-Slack-Signature` header over `v0:{timestamp}:{body}`
    /// (Slack's request-signing scheme).
    pub fn verify_signature(&self, timestamp: &str, body: &str, signature: &str) -> bool {
        let Some(expected_hex) = signature.strip_prefix("v0=") else {
            return false;
        };
        let base = format!("v0:{timestamp}:{body}");
        let Ok(mut mac) = HmacSha256::new_from_slice(self.signing_secret.as_bytes()) else {
            return false;
        };
        mac.update(base.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());
        constant_time_eq(&computed, expected_hex)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl Bot for SlackBot {
    async fn connect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Connecting);
        let resp = self
            .http
            .post(format!("{SLACK_API_BASE}/auth.test"))
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: SlackPostMessageResponse = resp.json().await.map_err(|e| BotError::Fatal(e.to_string()))?;
        if !body.ok {
            self.set_status(BotStatus::Disconnected);
            return Err(BotError::Fatal(body.error.unwrap_or_else(|| "auth.test failed".into())));
        }
        self.set_status(BotStatus::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BotError> {
        self.set_status(BotStatus::Disconnected);
        Ok(())
    }

    async fn send_message(&self, target: &str, content: &Content) -> Result<String, BotError> {
        let text = match content {
            Content::Text(t) => t.clone(),
            Content::Media(m) => m.url.clone().ok_or_else(|| BotError::MediaNotSupported("media without url".into()))?,
            Content::Reaction { .. } => return Err(BotError::MediaNotSupported("use react() for reactions".into())),
            Content::System { detail, .. } => detail.clone(),
        };
        let resp = self
            .http
            .post(format!("{SLACK_API_BASE}/chat.postMessage"))
            .bearer_auth(&self.bot_token)
            .json(&serde_json::json!({ "channel": target, "text": text }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: SlackPostMessageResponse = resp.json().await.map_err(|e| BotError::Retryable(e.to_string()))?;
        if !body.ok {
            return Err(BotError::Retryable(body.error.unwrap_or_else(|| "chat.postMessage failed".into())));
        }
        Ok(body.ts.unwrap_or_default())
    }

    async fn react(&self, target_message_id: &str, emoji: &str) -> Result<(), BotError> {
        let (channel, ts) = split_ref(target_message_id)?;
        let resp = self
            .http
            .post(format!("{SLACK_API_BASE}/reactions.add"))
            .bearer_auth(&self.bot_token)
            .json(&serde_json::json!({ "channel": channel, "timestamp": ts, "name": emoji }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        let body: SlackPostMessageResponse = resp.json().await.map_err(|e| BotError::Retryable(e.to_string()))?;
        if !body.ok {
            return Err(BotError::Retryable(body.error.unwrap_or_else(|| "reactions.add failed".into())));
        }
        Ok(())
    }

    async fn edit_message(&self, message_ref: &str, text: &str) -> Result<(), BotError> {
        let (channel, ts) = split_ref(message_ref)?;
        self.http
            .post(format!("{SLACK_API_BASE}/chat.update"))
            .bearer_auth(&self.bot_token)
            .json(&serde_json::json!({ "channel": channel, "ts": ts, "text": text }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        Ok(())
    }

    async fn delete_message(&self, message_ref: &str) -> Result<(), BotError> {
        let (channel, ts) = split_ref(message_ref)?;
        self.http
            .post(format!("{SLACK_API_BASE}/chat.delete"))
            .bearer_auth(&self.bot_token)
            .json(&serde_json::json!({ "channel": channel, "ts": ts }))
            .send()
            .await
            .map_err(|e| BotError::Retryable(e.to_string()))?;
        Ok(())
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo { platform: "slack".into(), name: self.name.clone(), max_text_len: SLACK_MAX_TEXT_LEN }
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
        // Slack delivers events via the Events API webhook, dispatched
        // from the gateway's HTTP layer, not a poll loop here.
        let _ = handler;
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), BotError> {
        Ok(())
    }
}

fn split_ref(message_ref: &str) -> Result<(&str, &str), BotError> {
    message_ref
        .split_once(':')
        .ok_or_else(|| BotError::InvalidTarget(format!("expected channel:ts, got {message_ref}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_signature_accepts_matching_hmac() {
        let bot = SlackBot::new("primary".into(), "xoxb-test".into(), "shh".into());
        let timestamp = "1531420618";
        let body = "token=abc&team_id=T1";
        let base = format!("v0:{timestamp}:{body}");
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(base.as_bytes());
        let sig = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
        assert!(bot.verify_signature(timestamp, body, &sig));
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let bot = SlackBot::new("primary".into(), "xoxb-test".into(), "shh".into());
        assert!(!bot.verify_signature("1531420618", "tampered", "v0=deadbeef"));
    }
}
