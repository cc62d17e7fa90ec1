use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use bytes::BufMut;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;

use crate::error::GatewayError;
use crate::pipeline::ChunkStream;
use crate::plugin::RequestContext;
use crate::reshape::{self, ChatChunkRenderer, ResponsesEventRenderer};
use crate::types::{ChatRequest, ModelRef, StreamEvent};
use crate::utils::pool::BufferPool;

use super::{GatewayHttpState, client_virtual_key, error_response};

const RAW_BODY_HEADER: &str = "x-gateway-raw-request-body";

pub(crate) async fn chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(vk_value) = client_virtual_key(&headers) else {
        return error_response(&GatewayError::Unauthorized);
    };

    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&GatewayError::InvalidRequest {
                reason: err.to_string(),
            });
        }
    };
    if raw_body_requested(&headers) {
        request.raw_body = Some(body.clone());
    }

    let Some(model) = ModelRef::parse(&request.model) else {
        return error_response(&GatewayError::UnknownModel {
            model: request.model.clone(),
        });
    };
    let mut ctx = RequestContext::new(vk_value, model, "chat_completion");

    if request.stream {
        let request_id = ctx.request_id.clone();
        let model = ctx.model.to_string();
        match state.gateway.chat_stream(ctx, request).await {
            Ok(chunks) => {
                chat_sse_response(state.sse_buffers.clone(), chunks, request_id, model)
            }
            Err(err) => error_response(&err),
        }
    } else {
        match state.gateway.chat(&mut ctx, request).await {
            Ok(response) => axum::Json(response).into_response(),
            Err(err) => error_response(&err),
        }
    }
}

pub(crate) async fn responses(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(vk_value) = client_virtual_key(&headers) else {
        return error_response(&GatewayError::Unauthorized);
    };

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            return error_response(&GatewayError::InvalidRequest {
                reason: err.to_string(),
            });
        }
    };
    let Some(chat_body) = reshape::responses_request_to_chat_body(&raw) else {
        return error_response(&GatewayError::InvalidRequest {
            reason: "responses request missing model or input".to_string(),
        });
    };
    let request: ChatRequest = match serde_json::from_value(chat_body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&GatewayError::InvalidRequest {
                reason: err.to_string(),
            });
        }
    };

    let Some(model) = ModelRef::parse(&request.model) else {
        return error_response(&GatewayError::UnknownModel {
            model: request.model.clone(),
        });
    };
    let mut ctx = RequestContext::new(vk_value, model, "responses");

    if request.stream {
        let request_id = ctx.request_id.clone();
        match state.gateway.chat_stream(ctx, request).await {
            Ok(chunks) => responses_sse_response(state.sse_buffers.clone(), chunks, request_id),
            Err(err) => error_response(&err),
        }
    } else {
        match state.gateway.chat(&mut ctx, request).await {
            Ok(response) => {
                axum::Json(reshape::chat_response_to_responses_body(&response)).into_response()
            }
            Err(err) => error_response(&err),
        }
    }
}

/// Everything else under `/v1` belongs to wire adapters this gateway does
/// not mount; reject it up front instead of guessing at a provider.
pub(crate) async fn unsupported(Path(rest): Path<String>) -> Response {
    error_response(&GatewayError::UnsupportedOperation {
        operation: format!("/v1/{rest}"),
    })
}

fn raw_body_requested(headers: &HeaderMap) -> bool {
    headers
        .get(RAW_BODY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn encode_frame(pool: &BufferPool, value: &Value) -> Bytes {
    let mut buffer = pool.acquire();
    buffer.put_slice(b"data: ");
    // Serialization into a Value cannot fail; write straight into the
    // pooled buffer.
    let _ = serde_json::to_writer((&mut buffer).writer(), value);
    buffer.put_slice(b"\n\n");
    let frame = buffer.split().freeze();
    pool.release(buffer);
    frame
}

fn sse_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}

/// Renders canonical chunks as `chat.completion.chunk` SSE frames with the
/// terminating `data: [DONE]` sentinel.
fn chat_sse_response(
    pool: Arc<BufferPool>,
    chunks: ChunkStream,
    request_id: String,
    model: String,
) -> Response {
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let mut renderer = ChatChunkRenderer::new(format!("chatcmpl-{request_id}"), model, created);
    let encode_pool = pool.clone();

    let frames = chunks
        .flat_map(move |item| {
            let frames: Vec<Bytes> = match item {
                Ok(chunk) => renderer
                    .render(&chunk.event)
                    .iter()
                    .map(|frame| encode_frame(&encode_pool, frame))
                    .collect(),
                Err(err) => {
                    let frame = serde_json::json!({
                        "error": { "message": err.to_string(), "type": err.error_type() }
                    });
                    vec![encode_frame(&encode_pool, &frame)]
                }
            };
            stream::iter(frames)
        })
        .chain(stream::once(std::future::ready(Bytes::from_static(
            b"data: [DONE]\n\n",
        ))))
        .map(Ok::<_, Infallible>);

    sse_headers(Body::from_stream(frames).into_response())
}

/// Renders canonical chunks as Responses-dialect SSE events; the stream ends
/// with `response.completed` rather than a `[DONE]` sentinel.
fn responses_sse_response(
    pool: Arc<BufferPool>,
    chunks: ChunkStream,
    request_id: String,
) -> Response {
    let mut renderer = ResponsesEventRenderer::new(format!("resp-{request_id}"));
    let encode_pool = pool.clone();

    let frames = chunks
        .flat_map(move |item| {
            let frames: Vec<Bytes> = match item {
                Ok(chunk) => renderer
                    .render(&chunk.event)
                    .iter()
                    .map(|frame| encode_frame(&encode_pool, frame))
                    .collect(),
                Err(err) => {
                    let frame = renderer.render(&StreamEvent::TerminalError {
                        message: err.to_string(),
                    });
                    frame
                        .iter()
                        .map(|frame| encode_frame(&encode_pool, frame))
                        .collect()
                }
            };
            stream::iter(frames)
        })
        .map(Ok::<_, Infallible>);

    sse_headers(Body::from_stream(frames).into_response())
}
