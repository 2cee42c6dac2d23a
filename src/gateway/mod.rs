//! Request Gateway: HTTP surface translating OpenAI/Anthropic
//! requests, dispatching via the Rule Engine to the Provider Client
//! Layer.

pub mod translate;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Value, json};
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::Error;
use crate::fields;
use crate::oauth::OAuthManager;
use crate::observability::{Observer, PrometheusObserver};
use crate::providers::{self, ModelResponse, NoopRecordSink, ProviderRequest, RecordSink};
use crate::rules::{ResolvedService, RuleEngine};
use crate::template::TemplateManager;
use crate::usage::{GroupBy, SortDirection, SortKey, UsageFilter, UsageOutcome, UsageRecorder};

pub struct GatewayState {
    pub rules: Arc<RuleEngine>,
    pub usage: Arc<UsageRecorder>,
    pub templates: Arc<TemplateManager>,
    pub oauth: Arc<OAuthManager>,
    pub observer: Arc<dyn Observer>,
    pub metrics: Arc<PrometheusObserver>,
    pub record_sink: Arc<dyn RecordSink>,
}

impl GatewayState {
    pub fn new(
        rules: Arc<RuleEngine>,
        usage: Arc<UsageRecorder>,
        templates: Arc<TemplateManager>,
        oauth: Arc<OAuthManager>,
        observer: Arc<dyn Observer>,
        metrics: Arc<PrometheusObserver>,
    ) -> Self {
        Self {
            rules,
            usage,
            templates,
            oauth,
            observer,
            metrics,
            record_sink: Arc::new(NoopRecordSink),
        }
    }
}

fn with_state(
    state: Arc<GatewayState>,
) -> impl Filter<Extract = (Arc<GatewayState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Mounts the full HTTP surface: LLM endpoints under `/tingly/...`, OAuth
/// authorization routes, usage/health/metrics control-plane routes.
pub fn routes(
    state: Arc<GatewayState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let openai_chat = warp::path!("tingly" / "openai" / "v1" / "chat" / "completions")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_openai_chat_completions);

    let anthropic_messages = warp::path!("tingly" / "anthropic" / "v1" / "messages")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_anthropic_messages);

    let openai_models = warp::path!("tingly" / "openai" / "v1" / "models")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_list_models);

    let anthropic_models = warp::path!("tingly" / "anthropic" / "v1" / "models")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_list_models);

    let oauth_authorize = warp::path!("oauth" / String / "authorize")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_oauth_authorize);

    let oauth_callback = warp::path!("oauth" / String / "callback")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_oauth_callback);

    let usage_aggregate = warp::path!("api" / "usage" / "aggregate")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_usage_aggregate);

    let usage_timeseries = warp::path!("api" / "usage" / "timeseries")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_usage_timeseries);

    let usage_records = warp::path!("api" / "usage" / "records")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_usage_records);

    let health = warp::path!("api" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "status": "ok" })));

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(handle_metrics);

    openai_chat
        .or(anthropic_messages)
        .or(openai_models)
        .or(anthropic_models)
        .or(oauth_authorize)
        .or(oauth_callback)
        .or(usage_aggregate)
        .or(usage_timeseries)
        .or(usage_records)
        .or(health)
        .or(metrics)
}

async fn handle_openai_chat_completions(
    body: Value,
    state: Arc<GatewayState>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    dispatch(body, state, "openai", translate::openai_request_to_internal).await
}

async fn handle_anthropic_messages(
    body: Value,
    state: Arc<GatewayState>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    dispatch(body, state, "anthropic", translate::anthropic_request_to_internal).await
}

/// Shared dispatch path for both inbound surfaces: parse → resolve a rule →
/// invoke the provider → translate the response back to the inbound
/// surface's wire shape, recording usage either way.
async fn dispatch(
    body: Value,
    state: Arc<GatewayState>,
    scenario: &str,
    parse: fn(&Value) -> Result<ProviderRequest, Error>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let started = std::time::Instant::now();
    let mut request = match parse(&body) {
        Ok(r) => r,
        Err(e) => return Ok(Box::new(error_reply(&e))),
    };
    let requested_model = request.model.clone();

    let resolved = match state.rules.resolve(scenario, &requested_model).await {
        Ok(r) => r,
        Err(e) => return Ok(Box::new(error_reply(&e))),
    };

    // The inbound model name never reaches upstream; only the resolved
    // service's effective model is sent.
    request.model = resolved.effective_model.clone();

    let client = match providers::build_client(resolved.provider.clone(), state.record_sink.clone()) {
        Ok(c) => c,
        Err(e) => return Ok(Box::new(error_reply(&e))),
    };

    if request.stream {
        return Ok(stream_response(request, resolved, state, client, scenario, requested_model).await);
    }

    let result = client.send(&request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(resp) => {
            record_outcome(&state, &resolved, scenario, &requested_model, &resp, UsageOutcome::Success, latency_ms, false).await;
            let reply_body = match scenario {
                "anthropic" => translate::model_response_to_anthropic(&resp, &requested_model),
                _ => translate::model_response_to_openai(&resp, &requested_model),
            };
            Ok(Box::new(warp::reply::json(&reply_body)))
        }
        Err(e) => {
            record_error_outcome(&state, &resolved, scenario, &requested_model, &e, latency_ms, false).await;
            Ok(Box::new(error_reply(&e)))
        }
    }
}

/// Streams a resolved call as SSE, shaping frames to match the inbound
/// surface: OpenAI `chat.completion.chunk` deltas for the OpenAI endpoint,
/// Anthropic `message_start`/`content_block_delta`/`message_delta`/
/// `message_stop` frames for the Anthropic one. Token counts surfaced on
/// any chunk are accumulated and recorded once the stream is exhausted, so
/// the usage row reflects what was actually sent rather than zeros.
async fn stream_response(
    request: ProviderRequest,
    resolved: ResolvedService,
    state: Arc<GatewayState>,
    client: Box<dyn providers::ProviderClient>,
    scenario: &str,
    requested_model: String,
) -> Box<dyn warp::Reply> {
    let started = std::time::Instant::now();
    let chunk_stream = match client.send_stream(&request).await {
        Ok(s) => s,
        Err(e) => return Box::new(error_reply(&e)),
    };

    let is_anthropic = scenario == "anthropic";
    let tokens = Arc::new(std::sync::Mutex::new((0u64, 0u64)));

    let prefix_events: Vec<Result<warp::sse::Event, Infallible>> = if is_anthropic {
        let (name, data) = translate::anthropic_message_start_event(&requested_model);
        vec![Ok(warp::sse::Event::default().event(name).json_data(data).unwrap_or_default())]
    } else {
        Vec::new()
    };
    let prefix = futures_util::stream::iter(prefix_events);

    let model = requested_model.clone();
    let tokens_for_map = tokens.clone();
    let events = chunk_stream.flat_map(move |item| {
        let frames: Vec<Result<warp::sse::Event, Infallible>> = match item {
            Ok(chunk) => {
                {
                    let mut acc = tokens_for_map.lock().unwrap();
                    if let Some(p) = chunk.prompt_tokens {
                        acc.0 = p;
                    }
                    if let Some(c) = chunk.completion_tokens {
                        acc.1 = c;
                    }
                }
                if is_anthropic {
                    let mut frames = Vec::new();
                    if !chunk.delta.is_empty() {
                        let (name, data) = translate::anthropic_content_block_delta_event(&chunk.delta);
                        frames.push(Ok(warp::sse::Event::default().event(name).json_data(data).unwrap_or_default()));
                    }
                    if let Some(reason) = &chunk.finish_reason {
                        let output_tokens = tokens_for_map.lock().unwrap().1;
                        let (name, data) = translate::anthropic_message_delta_event(Some(reason), output_tokens);
                        frames.push(Ok(warp::sse::Event::default().event(name).json_data(data).unwrap_or_default()));
                    }
                    frames
                } else {
                    vec![Ok(warp::sse::Event::default()
                        .json_data(translate::openai_delta_event(&chunk.delta, chunk.finish_reason.as_deref(), &model))
                        .unwrap_or_default())]
                }
            }
            Err(e) => vec![Ok(warp::sse::Event::default()
                .event("error")
                .json_data(translate::sse_error_event(&e))
                .unwrap_or_default())],
        };
        futures_util::stream::iter(frames)
    });

    let scenario_owned = scenario.to_string();
    let rules = state.rules.clone();
    let observer = state.observer.clone();
    let tokens_for_done = tokens.clone();
    let done = futures_util::stream::once(async move {
        let (prompt_tokens, completion_tokens) = *tokens_for_done.lock().unwrap();
        let latency_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = rules
            .record_outcome(&resolved, &scenario_owned, &requested_model, prompt_tokens, completion_tokens, UsageOutcome::Success, latency_ms, true)
            .await
        {
            observer.record_event("gateway", "gateway.usage_record_failed", &fields!(error = e.to_string()));
        }
        Ok::<_, Infallible>(if is_anthropic {
            let (name, data) = translate::anthropic_message_stop_event();
            warp::sse::Event::default().event(name).json_data(data).unwrap_or_default()
        } else {
            warp::sse::Event::default().data(translate::OPENAI_DONE_SENTINEL)
        })
    });

    let full_stream = prefix.chain(events).chain(done);
    Box::new(warp::sse::reply(warp::sse::keep_alive().stream(full_stream)))
}

async fn record_outcome(
    state: &GatewayState,
    resolved: &ResolvedService,
    scenario: &str,
    requested_model: &str,
    resp: &ModelResponse,
    status: UsageOutcome,
    latency_ms: u64,
    streamed: bool,
) {
    let input_tokens = resp.prompt_tokens.unwrap_or(0);
    let output_tokens = resp.completion_tokens.unwrap_or(0);
    if let Err(e) = state
        .rules
        .record_outcome(resolved, scenario, requested_model, input_tokens, output_tokens, status, latency_ms, streamed)
        .await
    {
        state
            .observer
            .record_event("gateway", "gateway.usage_record_failed", &fields!(error = e.to_string()));
    }
}

async fn record_error_outcome(
    state: &GatewayState,
    resolved: &ResolvedService,
    scenario: &str,
    requested_model: &str,
    err: &Error,
    latency_ms: u64,
    streamed: bool,
) {
    if let Err(e) = state
        .rules
        .record_outcome(resolved, scenario, requested_model, 0, 0, UsageOutcome::Error, latency_ms, streamed)
        .await
    {
        state.observer.record_event(
            "gateway",
            "gateway.usage_record_failed",
            &fields!(error = e.to_string(), upstream_error = err.to_string()),
        );
    }
}

async fn handle_list_models(state: Arc<GatewayState>) -> Result<impl warp::Reply, warp::Rejection> {
    let rules = state.rules.list_rules().await;
    let models: Vec<Value> = rules
        .iter()
        .flat_map(|r| r.services.iter().map(|s| json!({ "id": s.model, "object": "model" })))
        .collect();
    Ok(warp::reply::json(&json!({ "object": "list", "data": models })))
}

async fn handle_oauth_authorize(
    provider: String,
    state: Arc<GatewayState>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    match state.oauth.begin_authorization(&provider).await {
        Ok((session_id, url)) => Ok(Box::new(warp::reply::json(&json!({
            "session_id": session_id,
            "authorization_url": url,
        })))),
        Err(e) => Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&json!({ "error": e.to_string() })),
            StatusCode::BAD_REQUEST,
        ))),
    }
}

async fn handle_oauth_callback(
    provider: String,
    params: HashMap<String, String>,
    state: Arc<GatewayState>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let (Some(session_id), Some(code)) = (
        params.get("state").and_then(|s| Uuid::parse_str(s).ok()),
        params.get("code"),
    ) else {
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&json!({ "error": "missing state/code" })),
            StatusCode::BAD_REQUEST,
        )));
    };
    let provider_uuid = match state.rules.provider_id_by_name(&provider).await {
        Some(id) => id,
        None => {
            state.observer.record_event(
                "gateway",
                "gateway.oauth_callback_unknown_provider",
                &fields!(provider = provider.clone()),
            );
            Uuid::new_v4()
        }
    };
    match state.oauth.complete_authorization(session_id, code, provider_uuid).await {
        Ok(_token) => Ok(Box::new(warp::reply::json(&json!({ "status": "completed", "provider_uuid": provider_uuid })))),
        Err(e) => Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&json!({ "error": e.to_string() })),
            StatusCode::BAD_REQUEST,
        ))),
    }
}

/// Builds a `UsageFilter` from the `since`/`until`/`provider`/`model`/
/// `scenario`/`rule`/`status` query parameters shared by the aggregate,
/// time-series and records endpoints.
fn usage_filter_from_params(params: &HashMap<String, String>) -> UsageFilter {
    UsageFilter {
        since: params.get("since").and_then(|v| v.parse().ok()),
        until: params.get("until").and_then(|v| v.parse().ok()),
        provider: params.get("provider").cloned(),
        model: params.get("model").cloned(),
        scenario: params.get("scenario").cloned(),
        rule: params.get("rule").and_then(|v| Uuid::parse_str(v).ok()),
        status: params.get("status").map(|v| UsageOutcome::parse(v)),
    }
}

async fn handle_usage_aggregate(
    params: HashMap<String, String>,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let group_by = match params.get("groupBy").map(String::as_str).unwrap_or("model") {
        "provider" => GroupBy::Provider,
        "scenario" => GroupBy::Scenario,
        "rule" => GroupBy::Rule,
        "daily" => GroupBy::Daily,
        "hourly" => GroupBy::Hourly,
        _ => GroupBy::Model,
    };
    let filter = usage_filter_from_params(&params);
    let sort = params.get("sort").map(|v| SortKey::parse(v)).unwrap_or(SortKey::TotalTokens);
    let direction = params.get("direction").map(|v| SortDirection::parse(v)).unwrap_or(SortDirection::Desc);
    match state.usage.aggregate(group_by, &filter, sort, direction).await {
        Ok(rows) => Ok(warp::reply::json(&rows)),
        Err(e) => Ok(warp::reply::json(&json!({ "error": e.to_string() }))),
    }
}

async fn handle_usage_timeseries(
    params: HashMap<String, String>,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let interval = params.get("interval").map(String::as_str).unwrap_or("hour");
    let filter = usage_filter_from_params(&params);
    match state.usage.timeseries(interval, &filter).await {
        Ok(buckets) => Ok(warp::reply::json(&buckets)),
        Err(e) => Ok(warp::reply::json(&json!({ "error": e.to_string() }))),
    }
}

async fn handle_usage_records(
    params: HashMap<String, String>,
    state: Arc<GatewayState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let limit = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(100);
    let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    match state.usage.raw(limit, offset).await {
        Ok(rows) => Ok(warp::reply::json(&rows)),
        Err(e) => Ok(warp::reply::json(&json!({ "error": e.to_string() }))),
    }
}

fn handle_metrics(state: Arc<GatewayState>) -> impl warp::Reply {
    warp::reply::with_header(state.metrics.render(), "Content-Type", "text/plain; version=0.0.4")
}

fn error_reply(err: &Error) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(&err.to_body()), status)
}
