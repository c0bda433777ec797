//! The messages endpoint orchestrator
//!
//! For every inbound Claude request: validate the shared secret, insert the
//! pending history row, route the model, translate unless the provider is
//! native Anthropic, run the transformer hooks, dispatch, and stream or
//! return the answer while keeping the history row in sync.
//!
//! Error policy: failures before the first streamed byte return a single
//! JSON error body. Mid-stream failures emit an SSE `error` event, a
//! `message_delta` with `stop_reason: "error"`, and a final `message_stop`;
//! the row is marked `partial`. A client disconnect drops the upstream at
//! the next suspension point and also marks the row `partial`.

use crate::config::ProviderConfig;
use crate::history::{Status, Terminal};
use crate::protocol::claude::{ClaudeRequest, ClaudeResponse};
use crate::protocol::openai::OpenAiChatRequest;
use crate::server::error::ProxyError;
use crate::server::passthrough::PassthroughAssembler;
use crate::server::state::{client_hash, validate_client, AppState};
use crate::tokens::estimate_request_tokens;
use crate::transform::TransformerStack;
use crate::translate::{claude_to_openai, openai_to_claude, StreamAssembler, TokenLimits};
use crate::upstream::{Passthrough, SseChunkStream, SseEventStream};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Channel capacity for outbound SSE frames
const SSE_BUFFER: usize = 64;

/// POST /v1/messages
pub async fn messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    validate_client(&headers, &state.config)?;

    let req: ClaudeRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid messages request: {e}")))?;

    if let Some(hash) = client_hash(&headers) {
        tracing::debug!(client = %hash, model = %req.model, "messages request");
    }

    let started = Instant::now();
    let streaming = req.is_streaming();
    let row_id = state
        .history
        .insert(
            &req.model,
            String::from_utf8_lossy(&body).into_owned(),
            streaming,
        )
        .await
        .map_err(|e| ProxyError::Internal(format!("history insert failed: {e}")))?;

    let result = dispatch(&state, req, body, row_id, started).await;

    if let Err(e) = &result {
        state
            .history
            .complete(
                row_id,
                Terminal {
                    status: Status::Error,
                    response_json: None,
                    stop_reason: None,
                    input_tokens: 0,
                    output_tokens: 0,
                    error: Some(e.message()),
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            )
            .await;
    }

    result
}

async fn dispatch(
    state: &AppState,
    req: ClaudeRequest,
    raw_body: Bytes,
    row_id: i64,
    started: Instant,
) -> Result<Response, ProxyError> {
    let resolved = state
        .router
        .resolve(&req.model)
        .map_err(ProxyError::from_router)?;
    let provider = resolved.provider;
    let concrete = resolved.concrete_model;

    tracing::info!(
        claimed = %req.model,
        provider = %provider.name,
        concrete = %concrete,
        streaming = req.is_streaming(),
        "Routed request"
    );

    let stack = state.transformers.stack_for(&provider.name, &concrete);

    if provider.is_native_anthropic() {
        state
            .history
            .record_translation(row_id, &provider.name, &concrete, None)
            .await;
        return native_dispatch(state, provider, raw_body, req, stack, row_id, started).await;
    }

    openai_dispatch(state, provider, concrete, req, stack, row_id, started).await
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible path
// ─────────────────────────────────────────────────────────────────────────────

async fn openai_dispatch(
    state: &AppState,
    provider: ProviderConfig,
    concrete: String,
    req: ClaudeRequest,
    mut stack: TransformerStack,
    row_id: i64,
    started: Instant,
) -> Result<Response, ProxyError> {
    let req = stack.request_in(req);

    let limits = TokenLimits {
        max: state.config.max_tokens_limit,
        min: state.config.min_tokens_limit,
    };
    let openai_req = claude_to_openai(&req, &concrete, &limits);
    let openai_req = stack.request_out(openai_req);

    state
        .history
        .record_translation(
            row_id,
            &provider.name,
            &concrete,
            serde_json::to_string(&openai_req).ok(),
        )
        .await;

    let estimated_input = estimate_request_tokens(&req);

    if req.is_streaming() {
        let chunks = state
            .upstream
            .chat_completion_stream(&provider, &openai_req)
            .await
            .map_err(ProxyError::from_upstream)?;
        Ok(stream_openai_response(
            state.clone(),
            chunks,
            stack,
            req.model.clone(),
            estimated_input,
            row_id,
            started,
        ))
    } else {
        buffered_openai_response(
            state,
            &provider,
            &openai_req,
            stack,
            &req.model,
            estimated_input,
            row_id,
            started,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn buffered_openai_response(
    state: &AppState,
    provider: &ProviderConfig,
    openai_req: &OpenAiChatRequest,
    mut stack: TransformerStack,
    claimed_model: &str,
    estimated_input: u32,
    row_id: i64,
    started: Instant,
) -> Result<Response, ProxyError> {
    let resp = state
        .upstream
        .chat_completion(provider, openai_req)
        .await
        .map_err(ProxyError::from_upstream)?;

    let resp = stack.response_in(resp);
    let claude = openai_to_claude(&resp, claimed_model, estimated_input);
    let claude = stack.response_out(claude);

    complete_row(state, row_id, Status::Completed, &claude, None, started).await;
    Ok(Json(claude).into_response())
}

fn stream_openai_response(
    state: AppState,
    mut chunks: SseChunkStream,
    mut stack: TransformerStack,
    claimed_model: String,
    estimated_input: u32,
    row_id: i64,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(SSE_BUFFER);

    tokio::spawn(async move {
        let mut assembler = StreamAssembler::new(&claimed_model, estimated_input);
        let mut error_message: Option<String> = None;
        let mut disconnected = false;

        'read: loop {
            match chunks.next_chunk().await {
                Some(Ok(chunk)) => {
                    let chunk = stack.chunk_in(chunk);
                    for event in assembler.on_chunk(&chunk) {
                        let event = stack.event_out(event);
                        if tx.send(Ok(Bytes::from(event.to_sse()))).await.is_err() {
                            tracing::debug!("Client disconnected mid-stream");
                            disconnected = true;
                            break 'read;
                        }
                    }
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    tracing::warn!("Upstream stream error: {message}");
                    for event in assembler.fail(&message) {
                        let event = stack.event_out(event);
                        if tx.send(Ok(Bytes::from(event.to_sse()))).await.is_err() {
                            disconnected = true;
                            break;
                        }
                    }
                    error_message = Some(message);
                    break;
                }
                None => {
                    // Upstream ended; emit the terminal pair if the stream
                    // never carried a finish_reason
                    for event in assembler.finish() {
                        let event = stack.event_out(event);
                        if tx.send(Ok(Bytes::from(event.to_sse()))).await.is_err() {
                            disconnected = true;
                            break;
                        }
                    }
                    break;
                }
            }
        }

        let clean = error_message.is_none() && !disconnected && assembler.is_finished();
        let status = if clean { Status::Completed } else { Status::Partial };
        let assembled = assembler.assembled();
        complete_row(&state, row_id, status, &assembled, error_message, started).await;
    });

    sse_response(rx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Native Anthropic path
// ─────────────────────────────────────────────────────────────────────────────

async fn native_dispatch(
    state: &AppState,
    provider: ProviderConfig,
    raw_body: Bytes,
    req: ClaudeRequest,
    mut stack: TransformerStack,
    row_id: i64,
    started: Instant,
) -> Result<Response, ProxyError> {
    let passthrough = state
        .upstream
        .anthropic_passthrough(&provider, &raw_body, req.is_streaming())
        .await
        .map_err(ProxyError::from_upstream)?;

    match passthrough {
        Passthrough::Buffered { status, body } => {
            // Parse for hooks and accounting; an unparseable body is still
            // forwarded untouched
            match serde_json::from_slice::<ClaudeResponse>(&body) {
                Ok(claude) => {
                    let claude = stack.response_out(claude);
                    complete_row(state, row_id, Status::Completed, &claude, None, started).await;
                    Ok(Json(claude).into_response())
                }
                Err(e) => {
                    tracing::warn!("Native response not parseable as Message: {e}");
                    state
                        .history
                        .complete(
                            row_id,
                            Terminal {
                                status: Status::Completed,
                                response_json: String::from_utf8(body.to_vec()).ok(),
                                stop_reason: None,
                                input_tokens: 0,
                                output_tokens: 0,
                                error: None,
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        )
                        .await;
                    Ok(Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .map_err(|e| ProxyError::Internal(e.to_string()))?)
                }
            }
        }
        Passthrough::Stream(frames) => Ok(stream_native_response(
            state.clone(),
            frames,
            stack,
            row_id,
            started,
        )),
    }
}

fn stream_native_response(
    state: AppState,
    mut frames: SseEventStream,
    mut stack: TransformerStack,
    row_id: i64,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(SSE_BUFFER);

    tokio::spawn(async move {
        let mut tally = PassthroughAssembler::new();
        let mut error_message: Option<String> = None;
        let mut disconnected = false;

        loop {
            match frames.next_event().await {
                Some(Ok(frame)) => {
                    tally.observe(&frame);
                    let frame = stack.passthrough_out(frame);
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        tracing::debug!("Client disconnected mid-passthrough");
                        disconnected = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    tracing::warn!("Native upstream stream error: {message}");
                    // Terminate the client stream with the standard error
                    // sequence even though the upstream is native
                    for sse in [
                        crate::translate::StreamEvent::Error {
                            message: message.clone(),
                        },
                        crate::translate::StreamEvent::MessageDelta {
                            stop_reason: crate::protocol::claude::StopReason::Error,
                            output_tokens: tally.usage().1,
                        },
                        crate::translate::StreamEvent::MessageStop,
                    ] {
                        if tx.send(Ok(Bytes::from(sse.to_sse()))).await.is_err() {
                            disconnected = true;
                            break;
                        }
                    }
                    error_message = Some(message);
                    break;
                }
                None => break,
            }
        }

        let clean = error_message.is_none() && !disconnected && tally.is_complete();
        let status = if clean { Status::Completed } else { Status::Partial };
        let (input_tokens, output_tokens) = tally.usage();
        state
            .history
            .complete(
                row_id,
                Terminal {
                    status,
                    response_json: serde_json::to_string(&tally.assembled()).ok(),
                    stop_reason: tally.stop_reason().map(String::from),
                    input_tokens,
                    output_tokens,
                    error: error_message,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            )
            .await;
    });

    sse_response(rx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn complete_row(
    state: &AppState,
    row_id: i64,
    status: Status,
    response: &ClaudeResponse,
    error: Option<String>,
    started: Instant,
) {
    state
        .history
        .complete(
            row_id,
            Terminal {
                status,
                response_json: serde_json::to_string(response).ok(),
                stop_reason: response.stop_reason.map(|s| s.as_str().to_string()),
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
        .await;
}

fn sse_response(rx: mpsc::Receiver<Result<Bytes, std::convert::Infallible>>) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
