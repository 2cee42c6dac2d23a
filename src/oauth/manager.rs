//! OAuth manager: ties config, storage, flows and the refresher
//! together behind a single facade used by `config.rs`/the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::observability::Observer;

use super::flows::{self, PkceVerifier};
use super::refresher::OAuthRefresher;
use super::storage::OAuthStore;
use super::types::{OAuthSession, OAuthToken, ProviderOAuthConfig, SessionStatus};

const SESSION_TTL_SECS: i64 = 600;

pub struct OAuthManager {
    configs: HashMap<String, ProviderOAuthConfig>,
    store: Arc<OAuthStore>,
    refresher: Arc<OAuthRefresher>,
    http: reqwest::Client,
}

impl OAuthManager {
    pub fn new(
        configs: HashMap<String, ProviderOAuthConfig>,
        store: Arc<OAuthStore>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let refresher = Arc::new(OAuthRefresher::new(store.clone(), configs.clone(), observer));
        Self {
            configs,
            store,
            refresher,
            http: reqwest::Client::new(),
        }
    }

    pub async fn start_refresher(&self) {
        self.refresher.start().await;
    }

    pub async fn stop_refresher(&self) {
        self.refresher.stop().await;
    }

    fn config_for(&self, provider: &str) -> Result<&ProviderOAuthConfig> {
        self.configs
            .get(provider)
            .with_context(|| format!("unknown oauth provider '{provider}'"))
    }

    /// Starts an authorization-code (possibly PKCE) flow; returns the
    /// browser URL and a session id to poll/complete.
    pub async fn begin_authorization(&self, provider: &str) -> Result<(Uuid, String)> {
        let config = self.config_for(provider)?;
        if config.method.is_device_flow() {
            bail!("provider '{provider}' uses the device-code flow, not authorization_code");
        }
        let session_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();
        let verifier = config.method.uses_pkce().then(PkceVerifier::generate);
        let url = flows::build_auth_url(config, &session_id.to_string(), verifier.as_ref())?;

        let session = OAuthSession {
            session_id,
            status: SessionStatus::Pending,
            provider: provider.to_string(),
            user_id: None,
            created_at: now,
            expires_at: now + SESSION_TTL_SECS,
            provider_uuid: None,
            error: None,
            pending_secret: verifier.map(|v| v.0),
        };
        self.store.put_session(&session).await?;
        Ok((session_id, url))
    }

    /// `HandleCallback`: exchanges the code and stores the token under
    /// `provider_uuid`, completing the session.
    pub async fn complete_authorization(
        &self,
        session_id: Uuid,
        code: &str,
        provider_uuid: Uuid,
    ) -> Result<OAuthToken> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .context("unknown oauth session")?;
        if session.status != SessionStatus::Pending {
            bail!("session {session_id} is not pending");
        }
        let config = self.config_for(&session.provider)?;
        let verifier = session.pending_secret.clone().map(PkceVerifier);

        let result = flows::exchange_code(&self.http, config, code, verifier.as_ref()).await;
        match result {
            Ok(token) => {
                self.store.put_token(provider_uuid, &token).await?;
                session.status = SessionStatus::Completed;
                session.provider_uuid = Some(provider_uuid);
                self.store.put_session(&session).await?;
                Ok(token)
            }
            Err(e) => {
                session.status = SessionStatus::Failed;
                session.error = Some(e.to_string());
                self.store.put_session(&session).await?;
                Err(e)
            }
        }
    }

    /// Device-code flow entry point; returns the session id plus the
    /// user-facing verification details.
    pub async fn begin_device_flow(
        &self,
        provider: &str,
    ) -> Result<(Uuid, flows::DeviceCodeResponse)> {
        let config = self.config_for(provider)?;
        if !config.method.is_device_flow() {
            bail!("provider '{provider}' does not use the device-code flow");
        }
        let resp = flows::initiate_device_code_flow(&self.http, config).await?;
        let session_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();
        let session = OAuthSession {
            session_id,
            status: SessionStatus::Pending,
            provider: provider.to_string(),
            user_id: None,
            created_at: now,
            expires_at: now + resp.expires_in,
            provider_uuid: None,
            error: None,
            pending_secret: Some(resp.device_code.clone()),
        };
        self.store.put_session(&session).await?;
        Ok((session_id, resp))
    }

    /// One poll attempt for a device-code session.
    /// Callers are expected to re-invoke at the response's `interval`.
    pub async fn poll_device_flow(
        &self,
        session_id: Uuid,
        provider_uuid: Uuid,
    ) -> Result<flows::PollOutcome> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .context("unknown oauth session")?;
        let config = self.config_for(&session.provider)?;
        let device_code = session
            .pending_secret
            .clone()
            .context("session missing device_code")?;

        let outcome = flows::poll_for_token(&self.http, config, &device_code).await?;
        if let flows::PollOutcome::Token(token) = &outcome {
            self.store.put_token(provider_uuid, token).await?;
            session.status = SessionStatus::Completed;
            session.provider_uuid = Some(provider_uuid);
            self.store.put_session(&session).await?;
        }
        Ok(outcome)
    }

    pub async fn get_token(&self, provider_uuid: Uuid) -> Result<Option<OAuthToken>> {
        self.store.get_token(provider_uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::CompositeObserver;

    fn sample_configs() -> HashMap<String, ProviderOAuthConfig> {
        let mut map = HashMap::new();
        map.insert(
            "github-copilot".to_string(),
            ProviderOAuthConfig {
                display_name: "github-copilot".into(),
                client_id: "abc".into(),
                client_secret: None,
                auth_url: "https://example.com/auth".into(),
                token_url: "https://example.com/token".into(),
                device_code_url: Some("https://example.com/device".into()),
                scopes: vec![],
                auth_style: super::super::types::AuthStyle::InParams,
                method: super::super::types::OAuthMethod::AuthorizationCodePkce,
                redirect_url: "http://localhost:8787/callback".into(),
                console_url: None,
                extra_auth_params: HashMap::new(),
                extra_token_params: HashMap::new(),
                extra_token_headers: HashMap::new(),
            },
        );
        map
    }

    #[tokio::test]
    async fn begin_authorization_creates_pending_session_with_pkce_secret() {
        let store = Arc::new(OAuthStore::open_in_memory().unwrap());
        let observer: Arc<dyn Observer> = Arc::new(CompositeObserver::new(vec![]));
        let manager = OAuthManager::new(sample_configs(), store.clone(), observer);
        let (session_id, url) = manager.begin_authorization("github-copilot").await.unwrap();
        assert!(url.contains("code_challenge="));
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert!(session.pending_secret.is_some());
    }

    #[tokio::test]
    async fn device_flow_rejected_for_non_device_provider() {
        let store = Arc::new(OAuthStore::open_in_memory().unwrap());
        let observer: Arc<dyn Observer> = Arc::new(CompositeObserver::new(vec![]));
        let manager = OAuthManager::new(sample_configs(), store, observer);
        let result = manager.begin_device_flow("github-copilot").await;
        assert!(result.is_err());
    }
}
