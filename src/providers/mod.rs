//! Provider Client Layer: a uniform facade over OpenAI-style,
//! Anthropic-style, and Google-style wire protocols.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod transport;
pub mod types;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Error;
use crate::rules::{ApiStyle, Provider};

pub use transport::{CallRecord, NoopRecordSink, RecordSink, Transport};
pub use types::{ChatMessage, ModelResponse, ParsedToolCall, ProviderRequest, StreamChunk, ToolCallResult};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, Error>> + Send>>;

/// Network and protocol errors propagate verbatim; this layer never
/// retries, that's the Gateway's decision.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, req: &ProviderRequest) -> Result<ModelResponse, Error>;
    async fn send_stream(&self, req: &ProviderRequest) -> Result<ChunkStream, Error>;
}

/// Builds a `ProviderClient` for `provider`'s API style, wiring proxy and
/// OAuth-header-hook transport, with an optional call recorder.
pub fn build_client(
    provider: Provider,
    sink: Arc<dyn RecordSink>,
) -> Result<Box<dyn ProviderClient>, Error> {
    let transport = Transport::build(&provider, sink)?;
    Ok(match provider.api_style {
        ApiStyle::Openai => Box::new(openai::OpenAiClient::new(provider, transport)),
        ApiStyle::Anthropic => Box::new(anthropic::AnthropicClient::new(provider, transport)),
        ApiStyle::Google => Box::new(google::GoogleClient::new(provider, transport)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AuthType};
    use uuid::Uuid;

    fn sample_provider(style: ApiStyle) -> Provider {
        Provider {
            id: Uuid::new_v4(),
            name: "test".into(),
            api_style: style,
            api_base: "https://example.com/v1".into(),
            auth_type: AuthType::Key,
            access_token: Some("sk-test".into()),
            oauth_detail: None,
            proxy_url: None,
        }
    }

    #[test]
    fn build_client_dispatches_by_api_style() {
        let sink: Arc<dyn RecordSink> = Arc::new(NoopRecordSink);
        for style in [ApiStyle::Openai, ApiStyle::Anthropic, ApiStyle::Google] {
            assert!(build_client(sample_provider(style), sink.clone()).is_ok());
        }
    }
}
