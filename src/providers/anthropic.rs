//! Anthropic-style wire client: messages, streamed + whole,
//! message-count-tokens, and the beta twin.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::error::Error;
use crate::rules::Provider;

use super::transport::Transport;
use super::types::{ChatMessage, ModelResponse, ParsedToolCall, ProviderRequest, StreamChunk};
use super::{ChunkStream, ProviderClient};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    provider: Provider,
    transport: Transport,
}

impl AnthropicClient {
    pub fn new(provider: Provider, transport: Transport) -> Self {
        Self { provider, transport }
    }

    fn request_body(&self, req: &ProviderRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(chat_message_to_json).collect();
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": req.stream,
        });
        if let Some(system) = &req.system {
            body["system"] = json!(system);
        }
        if let Some(tools) = &req.tools {
            body["tools"] = tools.clone();
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.provider.api_base.trim_end_matches('/'))
    }

    fn builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .transport
            .client
            .post(self.endpoint())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        builder = match &self.provider.oauth_detail {
            Some(detail) => builder.bearer_auth(&detail.access_token),
            None => match &self.provider.access_token {
                Some(token) => builder.header("x-api-key", token),
                None => builder,
            },
        };
        self.transport.apply_hook(builder, &[])
    }
}

fn chat_message_to_json(m: &ChatMessage) -> Value {
    json!({ "role": m.role, "content": m.content })
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn send(&self, req: &ProviderRequest) -> Result<ModelResponse, Error> {
        let body = self.request_body(req);
        let resp = self
            .transport
            .send_recorded(self.builder(&body), &self.provider.name, &req.model, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        let parsed: Value = resp.json().await?;
        Ok(parse_message(&parsed))
    }

    async fn send_stream(&self, req: &ProviderRequest) -> Result<ChunkStream, Error> {
        let mut body = self.request_body(req);
        body["stream"] = json!(true);
        let resp = self
            .transport
            .send_recorded(self.builder(&body), &self.provider.name, &req.model, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(sse_to_anthropic_chunks(byte_stream)))
    }
}

async fn upstream_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Error::upstream(status, body)
}

fn parse_message(v: &Value) -> ModelResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ParsedToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                }),
                _ => {}
            }
        }
    }
    ModelResponse {
        text,
        tool_calls,
        finish_reason: v["stop_reason"].as_str().map(String::from),
        prompt_tokens: v["usage"]["input_tokens"].as_u64(),
        completion_tokens: v["usage"]["output_tokens"].as_u64(),
    }
}

fn sse_to_anthropic_chunks(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = Result<StreamChunk, Error>> + Send {
    futures_util::stream::unfold((byte_stream, String::new()), |(mut stream, mut pending)| async move {
        loop {
            if let Some(pos) = pending.find("\n\n") {
                let event = pending[..pos].to_string();
                pending = pending[pos + 2..].to_string();
                if let Some(chunk) = parse_anthropic_event(&event) {
                    return Some((chunk, (stream, pending)));
                }
                continue;
            }
            match stream.next().await {
                Some(Ok(bytes)) => pending.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(e)) => return Some((Err(Error::from(e)), (stream, pending))),
                None => return None,
            }
        }
    })
}

fn parse_anthropic_event(event: &str) -> Option<Result<StreamChunk, Error>> {
    let mut event_type = None;
    let mut data_line = None;
    for line in event.lines() {
        if let Some(t) = line.strip_prefix("event: ") {
            event_type = Some(t.trim());
        } else if let Some(d) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            data_line = Some(d.trim());
        }
    }
    let data = serde_json::from_str::<Value>(data_line?).ok()?;
    match event_type? {
        "content_block_delta" => {
            let delta = data["delta"]["text"].as_str().unwrap_or_default().to_string();
            Some(Ok(StreamChunk {
                delta,
                finish_reason: None,
                prompt_tokens: None,
                completion_tokens: None,
            }))
        }
        "message_delta" => Some(Ok(StreamChunk {
            delta: String::new(),
            finish_reason: data["delta"]["stop_reason"].as_str().map(String::from),
            prompt_tokens: None,
            completion_tokens: data["usage"]["output_tokens"].as_u64(),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_with_text_and_tool_use_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "hello " },
                { "type": "tool_use", "id": "t1", "name": "search", "input": { "q": "rust" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 12, "output_tokens": 4 }
        });
        let parsed = parse_message(&body);
        assert_eq!(parsed.text, "hello ");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search");
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_use"));
    }
}
