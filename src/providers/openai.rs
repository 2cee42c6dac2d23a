//! OpenAI-style wire client: chat-completions, streamed + whole.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::error::Error;
use crate::rules::Provider;

use super::transport::Transport;
use super::types::{ChatMessage, ModelResponse, ParsedToolCall, ProviderRequest, StreamChunk};
use super::{ChunkStream, ProviderClient};

pub struct OpenAiClient {
    provider: Provider,
    transport: Transport,
}

impl OpenAiClient {
    pub fn new(provider: Provider, transport: Transport) -> Self {
        Self { provider, transport }
    }

    fn request_body(&self, req: &ProviderRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for m in &req.messages {
            messages.push(chat_message_to_json(m));
        }
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": req.stream,
        });
        if let Some(tools) = &req.tools {
            body["tools"] = tools.clone();
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.provider.api_base.trim_end_matches('/'))
    }

    fn builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.transport.client.post(self.endpoint()).json(body);
        if let Some(token) = &self.provider.access_token {
            builder = builder.bearer_auth(token);
        }
        self.transport.apply_hook(builder, &[])
    }
}

fn chat_message_to_json(m: &ChatMessage) -> Value {
    let mut v = json!({ "role": m.role, "content": m.content });
    if let Some(tool_calls) = &m.tool_calls {
        v["tool_calls"] = tool_calls.clone();
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

#[async_trait]
impl ProviderClient for OpenAiClient {
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
        Ok(parse_chat_completion(&parsed))
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
        Ok(Box::pin(sse_to_openai_chunks(byte_stream)))
    }
}

async fn upstream_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Error::upstream(status, body)
}

fn parse_chat_completion(v: &Value) -> ModelResponse {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    let text = message["content"].as_str().unwrap_or_default().to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    Some(ParsedToolCall {
                        id: tc["id"].as_str()?.to_string(),
                        name: tc["function"]["name"].as_str()?.to_string(),
                        arguments: serde_json::from_str(tc["function"]["arguments"].as_str().unwrap_or("{}"))
                            .unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ModelResponse {
        text,
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().map(String::from),
        prompt_tokens: v["usage"]["prompt_tokens"].as_u64(),
        completion_tokens: v["usage"]["completion_tokens"].as_u64(),
    }
}

/// Parses OpenAI's `text/event-stream` delta chunks into `StreamChunk`s.
fn sse_to_openai_chunks(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = Result<StreamChunk, Error>> + Send {
    let mut buf = String::new();
    futures_util::stream::unfold((byte_stream, buf.split_off(0)), |(mut stream, mut pending)| async move {
        loop {
            if let Some(pos) = pending.find("\n\n") {
                let event = pending[..pos].to_string();
                pending = pending[pos + 2..].to_string();
                if let Some(chunk) = parse_sse_event(&event) {
                    return Some((chunk, (stream, pending)));
                }
                continue;
            }
            match stream.next().await {
                Some(Ok(bytes)) => {
                    pending.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => return Some((Err(Error::from(e)), (stream, pending))),
                None => return None,
            }
        }
    })
}

fn parse_sse_event(event: &str) -> Option<Result<StreamChunk, Error>> {
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Some(Ok(StreamChunk {
                delta: String::new(),
                finish_reason: Some("stop".to_string()),
                prompt_tokens: None,
                completion_tokens: None,
            }));
        }
        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let delta = parsed["choices"][0]["delta"]["content"].as_str().unwrap_or_default().to_string();
        let finish_reason = parsed["choices"][0]["finish_reason"].as_str().map(String::from);
        return Some(Ok(StreamChunk {
            delta,
            finish_reason,
            prompt_tokens: parsed["usage"]["prompt_tokens"].as_u64(),
            completion_tokens: parsed["usage"]["completion_tokens"].as_u64(),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_completion_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "get_weather", "arguments": "{\"city\":\"nyc\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let parsed = parse_chat_completion(&body);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "get_weather");
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(parsed.prompt_tokens, Some(10));
    }

    #[test]
    fn sse_event_with_done_sentinel_sets_finish_reason() {
        let event = "data: [DONE]";
        let chunk = parse_sse_event(event).unwrap().unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }
}
