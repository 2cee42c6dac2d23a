//! Configuration loading and atomic persistence.
//!
//! Editing configuration interactively (wizards) is out of scope; this
//! module only needs to load a TOML file into typed structs and, for the
//! one case where the system itself writes config (a completed OAuth flow
//! persisting a new `Provider`), save it back atomically.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::oauth::ProviderOAuthConfig;
use crate::rules::{Provider, Rule};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub oauth: std::collections::HashMap<String, ProviderOAuthConfig>,
    #[serde(default)]
    pub messengers: Vec<MessengerConfig>,
    #[serde(default)]
    pub webchat: WebChatConfig,
    #[serde(default)]
    pub remote_coder: RemoteCoderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    pub platform: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_webchat_cache")]
    pub cache_size: usize,
    #[serde(default = "default_webchat_history")]
    pub history_page_size: usize,
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self {
            cache_size: default_webchat_cache(),
            history_page_size: default_webchat_history(),
        }
    }
}

fn default_webchat_cache() -> usize {
    200
}
fn default_webchat_history() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCoderConfig {
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: i64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

impl Default for RemoteCoderConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_session_timeout_secs() -> i64 {
    30 * 60
}
fn default_retention_secs() -> i64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_binary_path")]
    pub binary_path: String,
    #[serde(default = "default_agent_permission_mode")]
    pub permission_mode: String,
    #[serde(default = "default_agent_remember_secs")]
    pub permission_remember_secs: i64,
    #[serde(default = "default_agent_request_timeout_secs")]
    pub permission_request_timeout_secs: u64,
    #[serde(default = "default_agent_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: default_agent_binary_path(),
            permission_mode: default_agent_permission_mode(),
            permission_remember_secs: default_agent_remember_secs(),
            permission_request_timeout_secs: default_agent_request_timeout_secs(),
            execution_timeout_secs: default_agent_execution_timeout_secs(),
        }
    }
}

fn default_agent_binary_path() -> String {
    "agent".to_string()
}
fn default_agent_permission_mode() -> String {
    "manual".to_string()
}
fn default_agent_remember_secs() -> i64 {
    15 * 60
}
fn default_agent_request_timeout_secs() -> u64 {
    120
}
fn default_agent_execution_timeout_secs() -> u64 {
    10 * 60
}

impl Config {
    /// Resolve the default config directory: `$TINGLY_CONFIG_DIR`, else
    /// `dirs::config_dir()/tingly-box`.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TINGLY_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tingly-box")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default path. Missing file yields a default config
    /// rather than an error — the gateway must still boot with nothing
    /// configured.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_path())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn save_default(&self) -> Result<()> {
        self.save(&Self::config_path())
    }

    /// Atomic write: serialize to a temp file in the same directory, then
    /// rename over the target (matches the cache-file atomicity used by
    /// the Template Manager elsewhere in this crate).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("serializing config")?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, raw).with_context(|| format!("writing temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::load(&dir.path().join("config.toml")).unwrap();
        assert!(cfg.providers.is_empty());
        assert_eq!(cfg.server.listen, "127.0.0.1:8787");
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.server.listen = "0.0.0.0:9000".to_string();
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.listen, "0.0.0.0:9000");
    }
}
