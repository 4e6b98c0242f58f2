// Request handler and upstream dispatch
// One axum route: POST /v1/messages speaking the Anthropic dialect. The
// handler classifies the model onto a pool, translates, dispatches with
// pool-specific failover, reassembles streams, and corrects tool calls on
// the way back.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use serde_json::json;

use super::anthropic::{ContentBlock, MessagesRequest, MessagesResponse};
use super::config::{PoolClass, PoolSettings, Settings};
use super::correction::{CorrectionOutcome, CorrectionService, ToolUseCall};
use super::error::ProxyError;
use super::health::EndpointHealthManager;
use super::loop_detector;
use super::openai::{ChatCompletionRequest, ChatCompletionResponse};
use super::overrides::OverrideEngine;
use super::stream;
use super::transform::{self, TransformContext};
use super::truncate_text;

/// Shared state handed to every request task.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub health: Arc<EndpointHealthManager>,
    pub client: reqwest::Client,
    pub overrides: Arc<OverrideEngine>,
    pub correction: Arc<CorrectionService>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>) -> Result<Self, ProxyError> {
        let health = Arc::new(EndpointHealthManager::new(
            settings.circuit_breaker.to_settings(),
        ));
        health.initialize_endpoints(&settings.big_model.endpoints);
        health.initialize_endpoints(&settings.small_model.endpoints);
        health.initialize_endpoints(&settings.correction.endpoints);

        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()?;

        let overrides = Arc::new(OverrideEngine::compile(&settings.system_message_overrides)?);
        let correction = Arc::new(CorrectionService::new(
            settings.clone(),
            health.clone(),
            client.clone(),
        ));

        Ok(Self {
            settings,
            health,
            client,
            overrides,
            correction,
        })
    }
}

/// Per-request context for log correlation. No globals.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: String,
}

impl RequestScope {
    fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Non-POST methods on the route fall out as 405 automatically.
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let scope = RequestScope::new();

    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            log::warn!("[{}] rejecting malformed body: {}", scope.request_id, err);
            return error_response(&ProxyError::InvalidRequest(err.to_string()));
        }
    };

    match process_request(&state, &scope, request).await {
        Ok(response) => (StatusCode::OK, axum::Json(response)).into_response(),
        Err(err) => {
            log::error!("[{}] request failed: {}", scope.request_id, err);
            error_response(&err)
        }
    }
}

async fn process_request(
    state: &AppState,
    scope: &RequestScope,
    mut request: MessagesRequest,
) -> Result<MessagesResponse, ProxyError> {
    let settings = &state.settings;

    // Trailing-window truncation, if configured.
    if settings.conversation_truncation > 0
        && request.messages.len() > settings.conversation_truncation
    {
        let drop = request.messages.len() - settings.conversation_truncation;
        log::info!(
            "[{}] truncating conversation: dropping {} leading messages",
            scope.request_id,
            drop
        );
        request.messages.drain(..drop);
    }

    // Loop detection short-circuits before anything goes upstream.
    let detection = loop_detector::detect(&request.messages);
    if detection.has_loop {
        log::warn!(
            "[{}] loop detected: {:?} on '{}' ({} occurrences); breaking",
            scope.request_id,
            detection.loop_type,
            detection.tool_name,
            detection.count
        );
        return Ok(loop_detector::breaking_response(&detection, &request.model));
    }

    let pool_class = settings.pool_for_model(&request.model);
    let pool = match pool_class {
        PoolClass::Small => &settings.small_model,
        _ => &settings.big_model,
    };

    let ctx = TransformContext {
        target_model: if pool.model.is_empty() {
            &request.model
        } else {
            &pool.model
        },
        handle_empty_tool_results: settings.handle_empty_tool_results,
        tool_descriptions: &settings.tool_descriptions,
        overrides: Some(state.overrides.as_ref()),
        stream: request.stream.unwrap_or(false),
    };
    let upstream_request = transform::anthropic_to_openai(&request, &ctx)?;

    if settings.print_system_message {
        if let Some(super::openai::ChatMessage::System { content }) =
            upstream_request.messages.first()
        {
            log::info!(
                "[{}] system message: {}",
                scope.request_id,
                truncate_text(content, 500)
            );
        }
    }

    let upstream_response = dispatch(state, scope, pool_class, pool, &upstream_request).await?;

    let mut response =
        transform::openai_to_anthropic(&upstream_response, &request.model, settings.harmony_parsing);

    correct_tool_calls(state, scope, &request, &mut response).await;

    Ok(response)
}

/// Pool-specific dispatch. Small and correction pools fail over within the
/// request; the big pool gets exactly one attempt against its configured
/// endpoint because big-model calls may legitimately run for a very long
/// time and must not be blocked by breaker state.
async fn dispatch(
    state: &AppState,
    scope: &RequestScope,
    pool_class: PoolClass,
    pool: &PoolSettings,
    request: &ChatCompletionRequest,
) -> Result<ChatCompletionResponse, ProxyError> {
    if pool.endpoints.is_empty() {
        return Err(ProxyError::PoolExhausted);
    }

    match pool_class {
        PoolClass::Big => {
            let endpoint = &pool.endpoints[0];
            log::info!("[{}] dispatching to big pool: {}", scope.request_id, endpoint);
            send_upstream(state, endpoint, pool, request, false).await
        }
        PoolClass::Small | PoolClass::Correction => {
            let mut candidates: Vec<String> = Vec::with_capacity(pool.endpoints.len());
            if let Some(first) = state.health.healthy_endpoint(&pool.endpoints) {
                candidates.push(first);
            }
            for url in &pool.endpoints {
                if !candidates.contains(url) {
                    candidates.push(url.clone());
                }
            }

            for endpoint in &candidates {
                log::info!("[{}] trying endpoint {}", scope.request_id, endpoint);
                match send_upstream(state, endpoint, pool, request, true).await {
                    Ok(response) => {
                        state.health.record_success(endpoint);
                        return Ok(response);
                    }
                    Err(err @ ProxyError::UpstreamStatus { status, .. }) if status < 500 => {
                        // Client-class upstream errors pass through untouched.
                        return Err(err);
                    }
                    Err(err) => {
                        log::warn!(
                            "[{}] endpoint {} failed: {}",
                            scope.request_id,
                            endpoint,
                            err
                        );
                        state.health.record_failure(endpoint);
                    }
                }
            }
            Err(ProxyError::PoolExhausted)
        }
    }
}

async fn send_upstream(
    state: &AppState,
    endpoint: &str,
    pool: &PoolSettings,
    request: &ChatCompletionRequest,
    bounded: bool,
) -> Result<ChatCompletionResponse, ProxyError> {
    let mut builder = state
        .client
        .post(endpoint)
        .header("Authorization", format!("Bearer {}", pool.api_key))
        .header("Content-Type", "application/json")
        .json(request);
    if bounded {
        builder = builder.timeout(state.settings.request_timeout());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| ProxyError::EndpointUnavailable(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    let is_sse = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if is_sse {
        stream::collect_sse(response).await
    } else {
        Ok(response.json::<ChatCompletionResponse>().await?)
    }
}

/// Run every assistant tool_use block through the correction pipeline,
/// replacing repaired calls in place. Failures keep the original call; the
/// upstream tool result will tell the model what went wrong.
async fn correct_tool_calls(
    state: &AppState,
    scope: &RequestScope,
    request: &MessagesRequest,
    response: &mut MessagesResponse,
) {
    let Some(tools) = request.tools.as_deref() else {
        return;
    };
    if tools.is_empty() || !state.settings.correction.enabled {
        return;
    }

    let mut any_tool_calls = false;
    let mut any_failed = false;

    for block in response.content.iter_mut() {
        let ContentBlock::ToolUse { id, name, input } = block else {
            continue;
        };
        any_tool_calls = true;

        let candidate = ToolUseCall {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        };
        match state.correction.correct(candidate, tools).await {
            CorrectionOutcome::Valid(repaired) => {
                if repaired.name != *name || repaired.input != *input {
                    log::info!(
                        "[{}] corrected tool call '{}' -> '{}'",
                        scope.request_id,
                        name,
                        repaired.name
                    );
                }
                *name = repaired.name;
                *input = repaired.input;
            }
            CorrectionOutcome::Failed(original) => {
                any_failed = true;
                log::warn!(
                    "[{}] correction failed for '{}'; keeping original call",
                    scope.request_id,
                    original.name
                );
            }
            CorrectionOutcome::Skipped(_) => {}
        }
    }

    if any_failed {
        log::warn!("[{}] request completed with uncorrected tool calls", scope.request_id);
    }

    // When the model answered without tools, check whether the transcript
    // actually demanded them; an advisory only, never a retry.
    if !any_tool_calls {
        let required = state.correction.tool_necessity(&request.messages).await;
        if required {
            log::warn!(
                "[{}] transcript suggests tools were required but none were called",
                scope.request_id
            );
        }
    }
}

fn error_response(err: &ProxyError) -> Response {
    let status = err.status_code();
    let body = json!({
        "type": "error",
        "error": {
            "type": error_kind(status),
            "message": err.to_string(),
        }
    });
    (status, axum::Json(body)).into_response()
}

fn error_kind(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::BAD_GATEWAY => "api_error",
        _ => "api_error",
    }
}
