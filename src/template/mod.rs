//! Template Manager: three-tier provider catalog resolver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::rules::{ApiStyle, AuthType, Provider};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Api,
    Registry,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub api_doc_url: Option<String>,
    #[serde(default)]
    pub base_url_openai: Option<String>,
    #[serde(default)]
    pub base_url_anthropic: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub max_tokens: HashMap<String, u32>,
    #[serde(default)]
    pub supports_models_endpoint: bool,
    pub auth_type: AuthType,
    #[serde(default)]
    pub oauth_provider: Option<String>,
}

impl ProviderTemplate {
    /// Validation: id and name required; non-OAuth needs ≥1 base URL;
    /// OAuth needs `oauth_provider`.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.name.is_empty() {
            anyhow::bail!("template missing id or name");
        }
        match self.auth_type {
            AuthType::Key => {
                if self.base_url_openai.is_none() && self.base_url_anthropic.is_none() {
                    anyhow::bail!("key-auth template '{}' needs at least one base URL", self.id);
                }
            }
            AuthType::Oauth => {
                if self.oauth_provider.is_none() {
                    anyhow::bail!("oauth template '{}' needs oauth_provider", self.id);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Registry {
    pub providers: HashMap<String, ProviderTemplate>,
    pub version: u32,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope {
    registry: Registry,
    cached_at: i64,
    version: u32,
    etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPreference {
    EmbeddedOnly,
    EmbeddedFirst,
    Default,
}

pub struct TemplateManager {
    embedded: Registry,
    live: Arc<RwLock<Option<Registry>>>,
    live_source: Arc<RwLock<Source>>,
    cache_path: PathBuf,
    registry_url: Option<String>,
    http: reqwest::Client,
    etag: Arc<RwLock<Option<String>>>,
}

impl TemplateManager {
    pub fn new(cache_path: PathBuf, registry_url: Option<String>) -> Self {
        Self {
            embedded: embedded_catalog(),
            live: Arc::new(RwLock::new(None)),
            live_source: Arc::new(RwLock::new(Source::Embedded)),
            cache_path,
            registry_url,
            http: reqwest::Client::new(),
            etag: Arc::new(RwLock::new(None)),
        }
    }

    /// Parse failures on the embedded catalog are fatal — verified here at
    /// construction so callers fail fast rather than mid-request.
    pub fn validate_embedded(&self) -> Result<()> {
        for t in self.embedded.providers.values() {
            t.validate()?;
        }
        Ok(())
    }

    pub async fn initialize(&self, preference: InitPreference) {
        if preference == InitPreference::EmbeddedOnly {
            return;
        }
        if preference == InitPreference::EmbeddedFirst {
            if let Ok(Some(env)) = self.load_cache() {
                *self.live.write().await = Some(env.registry);
                *self.live_source.write().await = Source::Registry;
                *self.etag.write().await = env.etag;
            }
            return;
        }

        if let Ok(Some(env)) = self.load_cache() {
            let age = chrono::Utc::now().timestamp() - env.cached_at;
            if age < DEFAULT_CACHE_TTL.as_secs() as i64 {
                *self.live.write().await = Some(env.registry);
                *self.live_source.write().await = Source::Registry;
                *self.etag.write().await = env.etag;
                return;
            }
            *self.etag.write().await = env.etag;
        }

        let _ = self.fetch_remote().await;
    }

    fn load_cache(&self) -> Result<Option<CacheEnvelope>> {
        if !self.cache_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.cache_path)?;
        Ok(serde_json::from_str(&raw).ok())
    }

    fn save_cache(&self, env: &CacheEnvelope) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(env)?;
        let tmp = self.cache_path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.cache_path)?;
        Ok(())
    }

    /// Fetch remote registry with `If-None-Match`; on any failure the
    /// embedded floor is kept and the error never surfaces to the caller.
    async fn fetch_remote(&self) -> Result<()> {
        let Some(url) = &self.registry_url else {
            return Ok(());
        };
        let mut req = self.http.get(url);
        if let Some(etag) = self.etag.read().await.clone() {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if !resp.status().is_success() {
            anyhow::bail!("registry fetch failed: {}", resp.status());
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let registry: Registry = resp.json().await?;

        let env = CacheEnvelope {
            registry: registry.clone(),
            cached_at: chrono::Utc::now().timestamp(),
            version: registry.version,
            etag: etag.clone(),
        };
        self.save_cache(&env).ok();

        *self.live.write().await = Some(registry);
        *self.live_source.write().await = Source::Registry;
        *self.etag.write().await = etag;
        Ok(())
    }

    /// Scan live map first, then embedded.
    async fn find_template(&self, provider: &Provider) -> Option<(ProviderTemplate, Source)> {
        let live_source = *self.live_source.read().await;
        if let Some(live) = self.live.read().await.as_ref() {
            if let Some(t) = Self::match_in(live, provider) {
                return Some((t, live_source));
            }
        }
        Self::match_in(&self.embedded, provider).map(|t| (t, Source::Embedded))
    }

    fn match_in(registry: &Registry, provider: &Provider) -> Option<ProviderTemplate> {
        registry.providers.values().find(|t| match provider.auth_type {
            AuthType::Oauth => {
                let Some(detail) = &provider.oauth_detail else {
                    return false;
                };
                t.oauth_provider.as_deref() == Some(detail.provider_type.as_str())
            }
            AuthType::Key => match provider.api_style {
                ApiStyle::Openai => t.base_url_openai.as_deref() == Some(provider.api_base.as_str()),
                ApiStyle::Anthropic => {
                    t.base_url_anthropic.as_deref() == Some(provider.api_base.as_str())
                }
                ApiStyle::Google => false,
            },
        }).cloned()
    }

    /// `GetModelsForProvider`.
    pub async fn get_models_for_provider(
        &self,
        provider: &Provider,
    ) -> (Vec<String>, Source, Option<String>) {
        let Some((template, source)) = self.find_template(provider).await else {
            return (Vec::new(), Source::Embedded, Some("no matching template".into()));
        };

        if template.supports_models_endpoint {
            if let Ok(models) = self.probe_live_models(provider).await {
                if !models.is_empty() {
                    return (models, Source::Api, None);
                }
            }
        }

        (template.models.clone(), source, None)
    }

    async fn probe_live_models(&self, provider: &Provider) -> Result<Vec<String>> {
        let url = format!("{}/models", provider.api_base.trim_end_matches('/'));
        let mut req = self.http.get(url);
        if let Some(token) = &provider.access_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("models endpoint returned {}", resp.status());
        }
        #[derive(Deserialize)]
        struct ModelsResponse {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }
        let parsed: ModelsResponse = resp.json().await?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    /// `GetMaxTokensForModel`: exact match in the template's limits
    /// map, else the global default.
    pub async fn get_max_tokens_for_model(&self, provider: &Provider, model: &str) -> u32 {
        if let Some((template, _)) = self.find_template(provider).await {
            if let Some(limit) = template.max_tokens.get(model) {
                return *limit;
            }
        }
        DEFAULT_MAX_TOKENS
    }
}

/// Embedded fallback catalog — always a floor.
/// The actual JSON contents are an external collaborator out of scope
///; this seeds a minimal, valid set so the manager never starts
/// with an empty embedded map.
fn embedded_catalog() -> Registry {
    let mut providers = HashMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderTemplate {
            id: "openai".into(),
            name: "OpenAI".into(),
            api_doc_url: Some("https://platform.openai.com/docs".into()),
            base_url_openai: Some("https://api.openai.com/v1".into()),
            base_url_anthropic: None,
            models: vec!["gpt-4o".into(), "gpt-4o-mini".into()],
            max_tokens: HashMap::from([("gpt-4o".to_string(), 16384)]),
            supports_models_endpoint: true,
            auth_type: AuthType::Key,
            oauth_provider: None,
        },
    );
    providers.insert(
        "anthropic".to_string(),
        ProviderTemplate {
            id: "anthropic".into(),
            name: "Anthropic".into(),
            api_doc_url: Some("https://docs.anthropic.com".into()),
            base_url_openai: None,
            base_url_anthropic: Some("https://api.anthropic.com".into()),
            models: vec!["claude-sonnet-4-20250514".into()],
            max_tokens: HashMap::from([("claude-sonnet-4-20250514".to_string(), 8192)]),
            supports_models_endpoint: false,
            auth_type: AuthType::Key,
            oauth_provider: None,
        },
    );
    Registry {
        providers,
        version: 1,
        last_updated: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::AuthType as PAuthType;
    use uuid::Uuid;

    fn embedded_only_provider() -> Provider {
        Provider {
            id: Uuid::new_v4(),
            name: "openai-embedded".into(),
            api_style: ApiStyle::Openai,
            api_base: "https://api.openai.com/v1".into(),
            auth_type: PAuthType::Key,
            access_token: Some("sk-test".into()),
            oauth_detail: None,
            proxy_url: None,
        }
    }

    #[tokio::test]
    async fn s2_template_fallback_cascade() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = TemplateManager::new(
            dir.path().join("cache.json"),
            Some("http://127.0.0.1:1/unreachable".into()),
        );
        manager.initialize(InitPreference::Default).await;
        let provider = embedded_only_provider();
        let (models, source, err) = manager.get_models_for_provider(&provider).await;
        assert_eq!(source, Source::Embedded);
        assert!(err.is_none());
        assert!(!models.is_empty());
    }

    #[test]
    fn embedded_catalog_validates() {
        let dir = std::env::temp_dir();
        let manager = TemplateManager::new(dir.join("unused.json"), None);
        manager.validate_embedded().unwrap();
    }
}
