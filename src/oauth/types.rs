//! OAuth data model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    InHeader,
    InParams,
    InNone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthMethod {
    AuthorizationCode,
    AuthorizationCodePkce,
    DeviceCode,
    DeviceCodePkce,
}

impl OAuthMethod {
    pub fn uses_pkce(self) -> bool {
        matches!(self, OAuthMethod::AuthorizationCodePkce | OAuthMethod::DeviceCodePkce)
    }

    pub fn is_device_flow(self) -> bool {
        matches!(self, OAuthMethod::DeviceCode | OAuthMethod::DeviceCodePkce)
    }
}

/// Static per-provider OAuth wiring, sourced from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOAuthConfig {
    pub display_name: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub device_code_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub auth_style: AuthStyle,
    pub method: OAuthMethod,
    pub redirect_url: String,
    #[serde(default)]
    pub console_url: Option<String>,
    #[serde(default)]
    pub extra_auth_params: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub extra_token_params: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub extra_token_headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// unix seconds
    pub expiry: i64,
    #[serde(default)]
    pub scope: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl OAuthToken {
    pub fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        self.expiry - now <= margin_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

/// In-flight authorization attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSession {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub provider: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub provider_uuid: Option<Uuid>,
    #[serde(default)]
    pub error: Option<String>,
    /// PKCE verifier or device_code, held only for the session's lifetime.
    #[serde(default)]
    pub pending_secret: Option<String>,
}
