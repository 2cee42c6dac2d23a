//! Agent Abstraction: a canonical `Agent` interface fronting a pluggable
//! coding-agent backend (a real CLI subprocess, or a scripted stand-in for
//! tests), plus the normalized event stream and permission gate shared by
//! every backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod cli;
pub mod mock;
pub mod permission;

pub use permission::{PermissionDecision, PermissionGate, PermissionHandler, PermissionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    StreamJson,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent binary not available: {0}")]
    Unavailable(String),
    #[error("agent execution failed: {0}")]
    ExecutionFailed(String),
    #[error("agent execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed event stream: {0}")]
    MalformedEvent(String),
}

/// Normalized event types emitted during a run. Every variant carries
/// `session_id`, `agent_type` and `timestamp`; the rest is type-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Init { session_id: String, agent_type: String, timestamp: DateTime<Utc>, model: Option<String> },
    System { session_id: String, agent_type: String, timestamp: DateTime<Utc>, detail: String },
    Assistant { session_id: String, agent_type: String, timestamp: DateTime<Utc>, text: String },
    User { session_id: String, agent_type: String, timestamp: DateTime<Utc>, text: String },
    ToolUse { session_id: String, agent_type: String, timestamp: DateTime<Utc>, tool: String, input: serde_json::Value },
    ToolResult { session_id: String, agent_type: String, timestamp: DateTime<Utc>, tool: String, output: String, is_error: bool },
    PermissionRequest { session_id: String, agent_type: String, timestamp: DateTime<Utc>, request_id: String, tool: String, detail: String },
    PermissionResult { session_id: String, agent_type: String, timestamp: DateTime<Utc>, request_id: String, approved: bool, reason: Option<String> },
    Result { session_id: String, agent_type: String, timestamp: DateTime<Utc>, success: bool, summary: Option<String> },
    Error { session_id: String, agent_type: String, timestamp: DateTime<Utc>, message: String },
    StreamDelta { session_id: String, agent_type: String, timestamp: DateTime<Utc>, delta: String },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::Init { session_id, .. }
            | AgentEvent::System { session_id, .. }
            | AgentEvent::Assistant { session_id, .. }
            | AgentEvent::User { session_id, .. }
            | AgentEvent::ToolUse { session_id, .. }
            | AgentEvent::ToolResult { session_id, .. }
            | AgentEvent::PermissionRequest { session_id, .. }
            | AgentEvent::PermissionResult { session_id, .. }
            | AgentEvent::Result { session_id, .. }
            | AgentEvent::Error { session_id, .. }
            | AgentEvent::StreamDelta { session_id, .. } => session_id,
        }
    }
}

/// Receives normalized events in real time as a run progresses.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: AgentEvent);
}

/// No-op handler for callers that only want the final `ExecutionResult`.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {
    async fn on_event(&self, _event: AgentEvent) {}
}

#[derive(Clone)]
pub struct ExecutionOptions {
    pub project_path: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub timeout: Option<Duration>,
    pub session_id: Option<String>,
    pub handler: Option<Arc<dyn EventHandler>>,
    pub chat_id: Option<String>,
    pub platform: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            project_path: None,
            output_format: OutputFormat::Text,
            timeout: None,
            session_id: None,
            handler: None,
            chat_id: None,
            platform: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: String,
    pub session_id: Option<String>,
}

/// Canonical agent interface: `Execute`, `IsAvailable`, `Type`,
/// `SetDefaultFormat`/`GetDefaultFormat`. Implementations hold default
/// format in interior-mutable storage so the trait stays usable behind an
/// `Arc<dyn Agent>` shared across callers.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(&self, prompt: &str, options: ExecutionOptions) -> Result<ExecutionResult, AgentError>;
    async fn is_available(&self) -> bool;
    fn agent_type(&self) -> &str;
    fn set_default_format(&self, format: OutputFormat);
    fn default_format(&self) -> OutputFormat;
}

/// Registry of configured agents keyed by type, used where a caller
/// (the Remote-Coder session manager, a messenger command handler) needs
/// to pick an agent by name rather than hold a concrete type.
pub struct Registry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { agents: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, agent: Arc<dyn Agent>) {
        self.agents.write().await.insert(agent.agent_type().to_string(), agent);
    }

    pub async fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(agent_type).cloned()
    }

    pub async fn default_agent(&self) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.values().next().cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_event_session_id_extracts_across_variants() {
        let ev = AgentEvent::Assistant {
            session_id: "s1".into(),
            agent_type: "mock".into(),
            timestamp: Utc::now(),
            text: "hi".into(),
        };
        assert_eq!(ev.session_id(), "s1");
    }

    #[tokio::test]
    async fn registry_get_returns_registered_agent_by_type() {
        let registry = Registry::new();
        registry.register(Arc::new(mock::MockAgent::new("mock", vec!["ok".into()]))).await;
        assert!(registry.get("mock").await.is_some());
        assert!(registry.get("other").await.is_none());
    }
}
