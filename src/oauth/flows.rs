//! PKCE authorization-code and device-code flows.
//!
//! RFC 7636 (PKCE) and RFC 8628 (device-code) plumbing over a plain
//! `reqwest::Client`, in the same request-building style used for the
//! provider wire clients.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use base64::Engine;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::types::{AuthStyle, OAuthMethod, OAuthToken, ProviderOAuthConfig};

pub struct PkceVerifier(pub String);

impl PkceVerifier {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn challenge(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
    }
}

/// `GetAuthURL`: builds the browser-facing authorization URL.
pub fn build_auth_url(config: &ProviderOAuthConfig, state: &str, pkce: Option<&PkceVerifier>) -> Result<String> {
    let mut url = url::Url::parse(&config.auth_url).context("parsing auth_url")?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("client_id", &config.client_id);
        q.append_pair("redirect_uri", &config.redirect_url);
        q.append_pair("response_type", "code");
        q.append_pair("state", state);
        if !config.scopes.is_empty() {
            q.append_pair("scope", &config.scopes.join(" "));
        }
        if config.method.uses_pkce() {
            let verifier = pkce.context("pkce method requires a verifier")?;
            q.append_pair("code_challenge", &verifier.challenge());
            q.append_pair("code_challenge_method", "S256");
        }
        for (k, v) in &config.extra_auth_params {
            q.append_pair(k, v);
        }
    }
    Ok(url.to_string())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// `HandleCallback`: exchanges an authorization code for a token.
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
    code: &str,
    pkce: Option<&PkceVerifier>,
) -> Result<OAuthToken> {
    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", "authorization_code".into());
    params.insert("code", code.into());
    params.insert("redirect_uri", config.redirect_url.clone());
    params.insert("client_id", config.client_id.clone());
    if let Some(secret) = &config.client_secret {
        if config.auth_style != AuthStyle::InHeader {
            params.insert("client_secret", secret.clone());
        }
    }
    if let Some(verifier) = pkce {
        params.insert("code_verifier", verifier.0.clone());
    }
    for (k, v) in &config.extra_token_params {
        params.insert(k.as_str(), v.clone());
    }

    let token = post_token_request(http, config, &params).await?;
    to_oauth_token(token, &config.display_name)
}

/// `InitiateDeviceCodeFlow`.
#[derive(Debug, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    #[serde(default = "default_interval")]
    pub interval: i64,
}

fn default_interval() -> i64 {
    5
}

pub async fn initiate_device_code_flow(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
) -> Result<DeviceCodeResponse> {
    let url = config
        .device_code_url
        .as_ref()
        .context("device_code_url required for device-code method")?;
    let mut form: HashMap<&str, String> = HashMap::new();
    form.insert("client_id", config.client_id.clone());
    if !config.scopes.is_empty() {
        form.insert("scope", config.scopes.join(" "));
    }
    let resp = http.post(url).form(&form).send().await?;
    if !resp.status().is_success() {
        bail!("device code request failed: {}", resp.status());
    }
    Ok(resp.json().await?)
}

/// `PollForToken`: a single poll attempt. Callers
/// loop on `Pending` at `interval` seconds per the RFC's `slow_down`/
/// `authorization_pending` semantics.
pub enum PollOutcome {
    Token(OAuthToken),
    Pending,
    SlowDown,
    ExpiredToken,
    AccessDenied,
}

pub async fn poll_for_token(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
    device_code: &str,
) -> Result<PollOutcome> {
    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", "urn:ietf:params:oauth:grant-type:device_code".into());
    params.insert("device_code", device_code.into());
    params.insert("client_id", config.client_id.clone());

    let resp = build_token_request(http, config, &params).send().await?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();

    if status.is_success() {
        let token: TokenResponse = serde_json::from_value(body)?;
        return Ok(PollOutcome::Token(to_oauth_token(token, &config.display_name)?));
    }

    match body.get("error").and_then(|v| v.as_str()) {
        Some("authorization_pending") => Ok(PollOutcome::Pending),
        Some("slow_down") => Ok(PollOutcome::SlowDown),
        Some("expired_token") => Ok(PollOutcome::ExpiredToken),
        Some("access_denied") => Ok(PollOutcome::AccessDenied),
        _ => bail!("device token poll failed: {}", status),
    }
}

/// `RefreshToken`: used by the background refresher.
pub async fn refresh_token(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
    refresh_token: &str,
) -> Result<OAuthToken> {
    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", "refresh_token".into());
    params.insert("refresh_token", refresh_token.into());
    params.insert("client_id", config.client_id.clone());
    let token = post_token_request(http, config, &params).await?;
    to_oauth_token(token, &config.display_name)
}

fn build_token_request<'a>(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
    params: &HashMap<&str, String>,
) -> reqwest::RequestBuilder {
    let mut req = http.post(&config.token_url).form(params);
    if config.auth_style == AuthStyle::InHeader {
        if let Some(secret) = &config.client_secret {
            req = req.basic_auth(&config.client_id, Some(secret));
        }
    }
    for (k, v) in &config.extra_token_headers {
        req = req.header(k, v);
    }
    req
}

async fn post_token_request(
    http: &reqwest::Client,
    config: &ProviderOAuthConfig,
    params: &HashMap<&str, String>,
) -> Result<TokenResponse> {
    let resp = build_token_request(http, config, params).send().await?;
    if !resp.status().is_success() {
        bail!("token request failed: {}", resp.status());
    }
    Ok(resp.json().await?)
}

fn to_oauth_token(resp: TokenResponse, provider: &str) -> Result<OAuthToken> {
    let now = chrono::Utc::now().timestamp();
    Ok(OAuthToken {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token,
        token_type: resp.token_type,
        expiry: now + resp.expires_in.unwrap_or(3600),
        scope: resp.scope,
        provider: provider.to_string(),
        user_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(method: OAuthMethod) -> ProviderOAuthConfig {
        ProviderOAuthConfig {
            display_name: "github-copilot".into(),
            client_id: "client123".into(),
            client_secret: None,
            auth_url: "https://example.com/auth".into(),
            token_url: "https://example.com/token".into(),
            device_code_url: Some("https://example.com/device".into()),
            scopes: vec!["read".into()],
            auth_style: AuthStyle::InParams,
            method,
            redirect_url: "http://localhost:8787/callback".into(),
            console_url: None,
            extra_auth_params: HashMap::new(),
            extra_token_params: HashMap::new(),
            extra_token_headers: HashMap::new(),
        }
    }

    #[test]
    fn pkce_challenge_is_deterministic_for_verifier() {
        let verifier = PkceVerifier("abc123".into());
        assert_eq!(verifier.challenge(), verifier.challenge());
    }

    #[test]
    fn auth_url_includes_pkce_challenge_when_required() {
        let config = sample_config(OAuthMethod::AuthorizationCodePkce);
        let verifier = PkceVerifier::generate();
        let url = build_auth_url(&config, "state1", Some(&verifier)).unwrap();
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
    }

    #[test]
    fn auth_url_without_pkce_method_omits_challenge() {
        let config = sample_config(OAuthMethod::AuthorizationCode);
        let url = build_auth_url(&config, "state1", None).unwrap();
        assert!(!url.contains("code_challenge"));
    }
}
