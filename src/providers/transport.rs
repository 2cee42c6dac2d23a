//! HTTP transport composition for provider clients: proxy, the
//! OAuth request-hook table, and optional call recording.
//!
//! Request hooks are keyed by `oauth_provider` tag so each provider can
//! apply its own header rewriting. Retry is deliberately absent here —
//! that's the Gateway's job, not the transport's.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::rules::Provider;

use super::types::ChatMessage;

/// A request hook adapts headers/query in place for one `oauth_provider` tag.
pub type RequestHook = fn(reqwest::RequestBuilder, &[ChatMessage]) -> reqwest::RequestBuilder;

fn copilot_hook(builder: reqwest::RequestBuilder, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
    let is_agent_call = messages.last().map(|m| m.role != "user").unwrap_or(false);
    let x_initiator = if is_agent_call { "agent" } else { "user" };
    builder
        .header("Editor-Version", "vscode/1.90.0")
        .header("Copilot-Integration-Id", "vscode-chat")
        .header("X-Initiator", x_initiator)
}

/// Hooks are composed in declaration order; this table has one entry per
/// known OAuth provider tag that needs header adaptation.
fn hook_for(oauth_provider: &str) -> Option<RequestHook> {
    match oauth_provider {
        "github-copilot" => Some(copilot_hook),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub provider: String,
    pub model: String,
    pub request: Value,
    pub response: Option<Value>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// External collaborator consuming `(provider, model, request, response,
/// elapsed, error)` tuples asynchronously.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn enabled(&self) -> bool;
    async fn record(&self, record: CallRecord);
}

pub struct NoopRecordSink;

#[async_trait]
impl RecordSink for NoopRecordSink {
    fn enabled(&self) -> bool {
        false
    }
    async fn record(&self, _record: CallRecord) {}
}

/// Per-provider HTTP transport: one `reqwest::Client` to avoid connection
/// pool interference across providers, an optional proxy, an
/// optional OAuth header hook, and an optional recorder.
pub struct Transport {
    pub client: reqwest::Client,
    hook: Option<RequestHook>,
    sink: Arc<dyn RecordSink>,
}

impl Transport {
    pub fn build(provider: &Provider, sink: Arc<dyn RecordSink>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(300));
        if let Some(proxy_url) = &provider.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| Error::InvalidRequest(format!("invalid proxy_url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("building http client: {e}")))?;

        let hook = provider
            .oauth_detail
            .as_ref()
            .and_then(|d| hook_for(&d.provider_type));

        Ok(Self { client, hook, sink })
    }

    pub fn apply_hook(&self, builder: reqwest::RequestBuilder, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        match self.hook {
            Some(hook) => hook(builder, messages),
            None => builder,
        }
    }

    /// Sends `builder` and, if the sink is enabled, records the call.
    /// Streaming responses are handled by the caller directly — recording
    /// a streamed body is the caller's responsibility since Transport
    /// doesn't see the decoded delta stream.
    pub async fn send_recorded(
        &self,
        builder: reqwest::RequestBuilder,
        provider: &str,
        model: &str,
        request_body: &Value,
    ) -> Result<reqwest::Response, Error> {
        let start = Instant::now();
        let result = builder.send().await;
        if !self.sink.enabled() {
            return result.map_err(Error::from);
        }

        match &result {
            Ok(resp) => {
                let status = resp.status();
                self.sink
                    .record(CallRecord {
                        provider: provider.to_string(),
                        model: model.to_string(),
                        request: request_body.clone(),
                        response: Some(serde_json::json!({ "status": status.as_u16() })),
                        elapsed: start.elapsed(),
                        error: None,
                    })
                    .await;
            }
            Err(e) => {
                self.sink
                    .record(CallRecord {
                        provider: provider.to_string(),
                        model: model.to_string(),
                        request: request_body.clone(),
                        response: None,
                        elapsed: start.elapsed(),
                        error: Some(e.to_string()),
                    })
                    .await;
            }
        }
        result.map_err(Error::from)
    }
}
