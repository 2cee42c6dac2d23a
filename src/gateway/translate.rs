//! Wire-shape translation between OpenAI and Anthropic request/response
//! bodies. Only invoked when the resolved provider's API style
//! differs from the inbound surface.

use serde_json::{Value, json};

use crate::error::Error;
use crate::providers::{ChatMessage, ModelResponse, ProviderRequest};

/// Parses an OpenAI chat-completions body into the internal call shape.
/// `model` is overwritten by the caller with the resolved service's model.
pub fn openai_request_to_internal(body: &Value) -> Result<ProviderRequest, Error> {
    let messages_json = body["messages"]
        .as_array()
        .ok_or_else(|| Error::InvalidRequest("messages must be an array".into()))?;

    let mut system = None;
    let mut messages = Vec::new();
    for m in messages_json {
        let role = m["role"].as_str().unwrap_or("user").to_string();
        let content = m["content"].as_str().unwrap_or_default().to_string();
        if role == "system" {
            system = Some(content);
            continue;
        }
        messages.push(ChatMessage {
            role,
            content,
            tool_calls: m.get("tool_calls").cloned(),
            tool_call_id: m["tool_call_id"].as_str().map(String::from),
        });
    }

    Ok(ProviderRequest {
        model: body["model"].as_str().unwrap_or_default().to_string(),
        messages,
        system,
        max_tokens: body["max_tokens"].as_u64().unwrap_or(4096) as u32,
        stream: body["stream"].as_bool().unwrap_or(false),
        tools: body.get("tools").cloned(),
        temperature: body["temperature"].as_f64().map(|t| t as f32),
    })
}

/// Parses an Anthropic messages body into the internal call shape.
pub fn anthropic_request_to_internal(body: &Value) -> Result<ProviderRequest, Error> {
    let messages_json = body["messages"]
        .as_array()
        .ok_or_else(|| Error::InvalidRequest("messages must be an array".into()))?;

    let messages = messages_json
        .iter()
        .map(|m| ChatMessage {
            role: m["role"].as_str().unwrap_or("user").to_string(),
            content: m["content"].as_str().unwrap_or_default().to_string(),
            tool_calls: None,
            tool_call_id: None,
        })
        .collect();

    Ok(ProviderRequest {
        model: body["model"].as_str().unwrap_or_default().to_string(),
        messages,
        system: body["system"].as_str().map(String::from),
        max_tokens: body["max_tokens"].as_u64().unwrap_or(4096) as u32,
        stream: body["stream"].as_bool().unwrap_or(false),
        tools: body.get("tools").cloned(),
        temperature: body["temperature"].as_f64().map(|t| t as f32),
    })
}

/// Formats a `ModelResponse` as an OpenAI chat-completions response body.
pub fn model_response_to_openai(resp: &ModelResponse, model: &str) -> Value {
    let mut message = json!({ "role": "assistant", "content": resp.text });
    if !resp.tool_calls.is_empty() {
        message["tool_calls"] = json!(
            resp.tool_calls
                .iter()
                .map(|tc| json!({
                    "id": tc.id,
                    "type": "function",
                    "function": { "name": tc.name, "arguments": tc.arguments.to_string() }
                }))
                .collect::<Vec<_>>()
        );
    }
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": resp.finish_reason.clone().unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": {
            "prompt_tokens": resp.prompt_tokens.unwrap_or(0),
            "completion_tokens": resp.completion_tokens.unwrap_or(0),
            "total_tokens": resp.prompt_tokens.unwrap_or(0) + resp.completion_tokens.unwrap_or(0),
        }
    })
}

/// Formats a `ModelResponse` as an Anthropic messages response body.
pub fn model_response_to_anthropic(resp: &ModelResponse, model: &str) -> Value {
    let mut content = Vec::new();
    if !resp.text.is_empty() {
        content.push(json!({ "type": "text", "text": resp.text }));
    }
    for tc in &resp.tool_calls {
        content.push(json!({ "type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments }));
    }
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": resp.finish_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
        "usage": {
            "input_tokens": resp.prompt_tokens.unwrap_or(0),
            "output_tokens": resp.completion_tokens.unwrap_or(0),
        }
    })
}

/// Payload for one OpenAI-shaped SSE `data:` field, for a streamed delta.
/// Framing (`data: ... \n\n`) is the server's job, not this function's.
pub fn openai_delta_event(delta: &str, finish_reason: Option<&str>, model: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": delta },
            "finish_reason": finish_reason,
        }]
    })
}

/// The terminal sentinel value for the OpenAI-compatible stream surface.
pub const OPENAI_DONE_SENTINEL: &str = "[DONE]";

/// One frame of the Anthropic streaming surface: `(event name, data payload)`.
/// Anthropic names its SSE event per frame, unlike OpenAI's single
/// `chat.completion.chunk` shape, so callers set `warp::sse::Event::event`
/// from the first element.
pub fn anthropic_message_start_event(model: &str) -> (&'static str, Value) {
    (
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", uuid::Uuid::new_v4()),
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "usage": { "input_tokens": 0, "output_tokens": 0 },
            }
        }),
    )
}

pub fn anthropic_content_block_delta_event(delta: &str) -> (&'static str, Value) {
    (
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": delta },
        }),
    )
}

pub fn anthropic_message_delta_event(finish_reason: Option<&str>, output_tokens: u64) -> (&'static str, Value) {
    (
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": { "stop_reason": finish_reason },
            "usage": { "output_tokens": output_tokens },
        }),
    )
}

pub fn anthropic_message_stop_event() -> (&'static str, Value) {
    ("message_stop", json!({ "type": "message_stop" }))
}

/// Payload for the terminal `event: error` SSE frame.
pub fn sse_error_event(err: &Error) -> Value {
    serde_json::to_value(err.to_body()).unwrap_or_else(|_| json!({ "error": { "message": err.to_string() } }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_request_extracts_system_message() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "be terse" },
                { "role": "user", "content": "hi" }
            ]
        });
        let req = openai_request_to_internal(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn model_response_to_openai_includes_usage_totals() {
        let resp = ModelResponse {
            text: "hi".into(),
            tool_calls: vec![],
            finish_reason: Some("stop".into()),
            prompt_tokens: Some(3),
            completion_tokens: Some(2),
        };
        let body = model_response_to_openai(&resp, "gpt-4o");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }
}
