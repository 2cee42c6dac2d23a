//! Data model shared across the crate: Provider, Model identity, Rule, Service.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Well-known built-in rule UUIDs. Fixed so config and state-store
/// entries referencing them survive upgrades.
pub mod well_known {
    use uuid::{Uuid, uuid};

    pub const RULE_UUID_OPENAI: Uuid = uuid!("00000000-0000-0000-0000-000000000001");
    pub const RULE_UUID_ANTHROPIC: Uuid = uuid!("00000000-0000-0000-0000-000000000002");
    pub const RULE_UUID_CC: Uuid = uuid!("00000000-0000-0000-0000-000000000003");
    pub const RULE_UUID_CC_DEFAULT: Uuid = uuid!("00000000-0000-0000-0000-000000000004");
    pub const RULE_UUID_CC_HAIKU: Uuid = uuid!("00000000-0000-0000-0000-000000000005");
    pub const RULE_UUID_CC_OPUS: Uuid = uuid!("00000000-0000-0000-0000-000000000006");
    pub const RULE_UUID_CC_SONNET: Uuid = uuid!("00000000-0000-0000-0000-000000000007");
    pub const RULE_UUID_CC_SUBAGENT: Uuid = uuid!("00000000-0000-0000-0000-000000000008");
    pub const RULE_UUID_OPENCODE: Uuid = uuid!("00000000-0000-0000-0000-000000000009");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApiStyle {
    Openai,
    Anthropic,
    Google,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Key,
    Oauth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthDetail {
    pub provider_type: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp, seconds. Zero means "never expires".
    pub expiry: i64,
    pub user_id: String,
}

/// A named upstream LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub name: String,
    pub api_style: ApiStyle,
    pub api_base: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub oauth_detail: Option<OAuthDetail>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Provider {
    /// Invariant: auth type determines which credential fields are valid.
    pub fn is_valid(&self) -> bool {
        match self.auth_type {
            AuthType::Key => self.access_token.is_some(),
            AuthType::Oauth => self.oauth_detail.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tactic {
    RoundRobin,
    Weighted,
    Failover,
    Priority,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Unix timestamp, seconds, of the start of the current tumbling window.
    pub window_start: i64,
    pub window_request_count: u64,
    pub window_tokens_consumed: u64,
    pub window_input_tokens: u64,
    pub window_output_tokens: u64,
}

/// A rule's candidate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub provider: Uuid,
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    /// 0 disables quota enforcement for this service.
    #[serde(default)]
    pub time_window_seconds: i64,
    #[serde(default)]
    pub stats: ServiceStats,
}

fn default_weight() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl Service {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// A scenario dispatch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub scenario: String,
    #[serde(default)]
    pub model_pattern: Option<String>,
    #[serde(default)]
    pub response_model_override: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub services: Vec<Service>,
    pub tactic: Tactic,
}

impl Rule {
    /// A rule is "configured" iff active, has at least one active service
    /// with a nonempty provider+model, and that provider resolves.
    pub fn is_configured(&self, resolves: impl Fn(Uuid) -> bool) -> bool {
        self.active
            && self.services.iter().any(|s| {
                s.active
                    && !s.model.is_empty()
                    && resolves(s.provider)
            })
    }

    /// Exact-then-wildcard match of the requested model against the rule's
    /// pattern. `None` pattern matches anything.
    pub fn model_matches(&self, requested: &str) -> bool {
        match &self.model_pattern {
            None => true,
            Some(pattern) => {
                if pattern == requested {
                    return true;
                }
                wildcard_match(pattern, requested)
            }
        }
    }
}

/// Simple glob-style `*` wildcard matcher (no regex engine needed for a
/// single-wildcard pattern).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_prefix_pattern() {
        assert!(wildcard_match("claude-*", "claude-sonnet-4"));
        assert!(!wildcard_match("claude-*", "gpt-4"));
        assert!(wildcard_match("gpt-4", "gpt-4"));
        assert!(!wildcard_match("gpt-4", "gpt-4o"));
    }

    #[test]
    fn rule_configured_requires_resolving_provider() {
        let provider = Uuid::new_v4();
        let rule = Rule {
            id: Uuid::new_v4(),
            scenario: "openai".into(),
            model_pattern: None,
            response_model_override: None,
            active: true,
            services: vec![Service {
                provider,
                model: "gpt-4".into(),
                weight: 1,
                active: true,
                time_window_seconds: 0,
                stats: ServiceStats::default(),
            }],
            tactic: Tactic::Failover,
        };
        assert!(rule.is_configured(|id| id == provider));
        assert!(!rule.is_configured(|_| false));
    }
}
