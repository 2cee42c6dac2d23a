//! Google-style wire client: content generation, single + streaming
//! lazy sequence.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::error::Error;
use crate::rules::Provider;

use super::transport::Transport;
use super::types::{ChatMessage, ModelResponse, ProviderRequest, StreamChunk};
use super::{ChunkStream, ProviderClient};

pub struct GoogleClient {
    provider: Provider,
    transport: Transport,
}

impl GoogleClient {
    pub fn new(provider: Provider, transport: Transport) -> Self {
        Self { provider, transport }
    }

    fn request_body(&self, req: &ProviderRequest) -> Value {
        let contents: Vec<Value> = req.messages.iter().map(chat_message_to_content).collect();
        let mut body = json!({
            "contents": contents,
            "generationConfig": { "maxOutputTokens": req.max_tokens },
        });
        if let Some(system) = &req.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if let Some(temp) = req.temperature {
            body["generationConfig"]["temperature"] = json!(temp);
        }
        body
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!(
            "{}/models/{}:{}",
            self.provider.api_base.trim_end_matches('/'),
            model,
            method
        )
    }

    fn builder(&self, url: String, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.transport.client.post(url).json(body);
        if let Some(token) = &self.provider.access_token {
            builder = builder.query(&[("key", token.as_str())]);
        }
        self.transport.apply_hook(builder, &[])
    }
}

fn chat_message_to_content(m: &ChatMessage) -> Value {
    let role = if m.role == "assistant" { "model" } else { "user" };
    json!({ "role": role, "parts": [{ "text": m.content }] })
}

#[async_trait]
impl ProviderClient for GoogleClient {
    async fn send(&self, req: &ProviderRequest) -> Result<ModelResponse, Error> {
        let body = self.request_body(req);
        let url = self.endpoint(&req.model, false);
        let resp = self
            .transport
            .send_recorded(self.builder(url, &body), &self.provider.name, &req.model, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        let parsed: Value = resp.json().await?;
        Ok(parse_generate_content(&parsed))
    }

    async fn send_stream(&self, req: &ProviderRequest) -> Result<ChunkStream, Error> {
        let body = self.request_body(req);
        let url = self.endpoint(&req.model, true);
        let resp = self
            .transport
            .send_recorded(self.builder(url, &body), &self.provider.name, &req.model, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(json_array_to_chunks(byte_stream)))
    }
}

async fn upstream_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Error::upstream(status, body)
}

fn parse_generate_content(v: &Value) -> ModelResponse {
    let candidate = &v["candidates"][0];
    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    ModelResponse {
        text,
        tool_calls: Vec::new(),
        finish_reason: candidate["finishReason"].as_str().map(|s| s.to_lowercase()),
        prompt_tokens: v["usageMetadata"]["promptTokenCount"].as_u64(),
        completion_tokens: v["usageMetadata"]["candidatesTokenCount"].as_u64(),
    }
}

/// Google's streaming endpoint returns a lazily-flushed JSON array; each
/// top-level element is one `GenerateContentResponse`. We scan for
/// complete top-level objects as bytes arrive rather than requiring the
/// full array to close.
fn json_array_to_chunks(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = Result<StreamChunk, Error>> + Send {
    futures_util::stream::unfold((byte_stream, String::new()), |(mut stream, mut pending)| async move {
        loop {
            if let Some(obj) = extract_next_object(&mut pending) {
                if let Ok(parsed) = serde_json::from_str::<Value>(&obj) {
                    let response = parse_generate_content(&parsed);
                    return Some((
                        Ok(StreamChunk {
                            delta: response.text,
                            finish_reason: response.finish_reason,
                            prompt_tokens: response.prompt_tokens,
                            completion_tokens: response.completion_tokens,
                        }),
                        (stream, pending),
                    ));
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

/// Finds and removes the first complete brace-balanced `{...}` object in
/// `buf`, skipping array delimiters (`[`, `]`, `,`) and whitespace before it.
fn extract_next_object(buf: &mut String) -> Option<String> {
    let bytes = buf.as_bytes();
    let mut start = None;
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        let obj = buf[s..=i].to_string();
                        *buf = buf[i + 1..].to_string();
                        return Some(obj);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_content_response() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "hi" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 1 }
        });
        let parsed = parse_generate_content(&body);
        assert_eq!(parsed.text, "hi");
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn extract_next_object_handles_array_wrapper() {
        let mut buf = "[{\"a\":1},{\"b\":2}]".to_string();
        let first = extract_next_object(&mut buf).unwrap();
        assert_eq!(first, "{\"a\":1}");
        let second = extract_next_object(&mut buf).unwrap();
        assert_eq!(second, "{\"b\":2}");
    }
}
