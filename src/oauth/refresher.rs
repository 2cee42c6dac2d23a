//! Background token refresher.
//!
//! Sequential per-tick processing; one provider's failure doesn't block
//! the rest. Uses `retry::retry_with_backoff` for the token-endpoint call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::observability::{Observer, fields};
use crate::retry::{RetryDecision, RetryPolicy, RetryReason, retry_with_backoff};

use super::flows;
use super::storage::OAuthStore;
use super::types::{OAuthToken, ProviderOAuthConfig};

const REFRESH_MARGIN_SECS: i64 = 30 * 60;
const TICK_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct OAuthRefresher {
    store: Arc<OAuthStore>,
    configs: Arc<RwLock<HashMap<String, ProviderOAuthConfig>>>,
    http: reqwest::Client,
    observer: Arc<dyn Observer>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl OAuthRefresher {
    pub fn new(
        store: Arc<OAuthStore>,
        configs: HashMap<String, ProviderOAuthConfig>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            store,
            configs: Arc::new(RwLock::new(configs)),
            http: reqwest::Client::new(),
            observer,
            handle: RwLock::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut slot = self.handle.write().await;
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            handle.abort();
        }
    }

    async fn tick(&self) {
        let tokens = match self.store.all_tokens().await {
            Ok(t) => t,
            Err(e) => {
                self.observer.record_event(
                    "warn",
                    "oauth.refresh_tick_failed",
                    &fields!("error" => e.to_string()),
                );
                return;
            }
        };
        let now = chrono::Utc::now().timestamp();
        for (provider_uuid, token) in tokens {
            if !token.expires_within(now, REFRESH_MARGIN_SECS) {
                continue;
            }
            self.refresh_one(provider_uuid, token).await;
        }
    }

    async fn refresh_one(&self, provider_uuid: Uuid, token: OAuthToken) {
        let Some(refresh_token) = token.refresh_token.clone() else {
            self.observer.record_event(
                "warn",
                "oauth.refresh_skipped_no_refresh_token",
                &fields!("provider" => token.provider.clone()),
            );
            return;
        };
        let configs = self.configs.read().await;
        let Some(config) = configs.get(&token.provider).cloned() else {
            return;
        };
        drop(configs);

        let policy = RetryPolicy::http_default();
        let http = &self.http;
        let result = retry_with_backoff(
            &policy,
            |_attempt| {
                let http = http.clone();
                let config = config.clone();
                let refresh_token = refresh_token.clone();
                async move { flows::refresh_token(&http, &config, &refresh_token).await }
            },
            |r: &anyhow::Result<OAuthToken>| match r {
                Err(_) => RetryDecision::Retry {
                    reason: RetryReason::ServerError,
                    retry_after: None,
                },
                Ok(_) => RetryDecision::DoNotRetry,
            },
            |_attempt| {},
        )
        .await;

        match result {
            Ok(new_token) => {
                if let Err(e) = self.store.put_token(provider_uuid, &new_token).await {
                    self.observer.record_event(
                        "warn",
                        "oauth.refresh_store_failed",
                        &fields!("provider" => token.provider, "error" => e.to_string()),
                    );
                } else {
                    self.observer.record_event(
                        "info",
                        "oauth.refreshed",
                        &fields!("provider" => token.provider),
                    );
                }
            }
            Err(e) => {
                self.observer.record_event(
                    "warn",
                    "oauth.refresh_failed",
                    &fields!("provider" => token.provider, "error" => e.to_string()),
                );
            }
        }
    }
}
