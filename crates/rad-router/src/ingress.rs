use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use rad_common::GatewayError;
use rad_core::{EngineResponse, GatewayEngine, Principal};
use rad_protocol::anthropic::MessagesRequest;
use rad_protocol::gemini::GenerateContentRequest;
use rad_protocol::sse;
use rad_provider_core::ApiType;
use rad_transform::request::{anthropic_to_chat, gemini_to_chat};

use crate::admin::admin_events;
use crate::auth::{auth_gate, RequestTraceId};
use crate::error::ApiError;

#[derive(Clone)]
pub struct GatewayState {
    pub engine: GatewayEngine,
}

/// Authenticated ingress surface.
pub fn data_plane_router(engine: GatewayEngine) -> Router {
    let state = GatewayState { engine };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{*model_action}", post(gemini_generate))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

/// Unauthenticated liveness plus the token-gated admin event stream.
pub fn public_router(engine: GatewayEngine) -> Router {
    let state = GatewayState { engine };
    Router::new()
        .route("/health", get(health))
        .route("/v0/admin/events", get(admin_events))
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "active_streams": state.engine.active_streams(),
        "providers": state.engine.health_snapshot(),
    }))
}

async fn chat_completions(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Extension(trace_id): Extension<RequestTraceId>,
    Json(payload): Json<JsonValue>,
) -> Result<Response, ApiError> {
    let stream = payload
        .get("stream")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    dispatch(state, principal, trace_id.0, ApiType::Chat, payload, stream).await
}

async fn embeddings(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Extension(trace_id): Extension<RequestTraceId>,
    Json(payload): Json<JsonValue>,
) -> Result<Response, ApiError> {
    dispatch(
        state,
        principal,
        trace_id.0,
        ApiType::Embeddings,
        payload,
        false,
    )
    .await
}

async fn anthropic_messages(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Extension(trace_id): Extension<RequestTraceId>,
    Json(request): Json<MessagesRequest>,
) -> Result<Response, ApiError> {
    let stream = request.stream.unwrap_or(false);
    let chat = anthropic_to_chat(request);
    let payload = serde_json::to_value(&chat)
        .map_err(|err| ApiError(GatewayError::Internal(err.to_string())))?;
    dispatch(
        state,
        principal,
        trace_id.0,
        ApiType::Messages,
        payload,
        stream,
    )
    .await
}

async fn gemini_generate(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Extension(trace_id): Extension<RequestTraceId>,
    Path(model_action): Path<String>,
    Json(request): Json<GenerateContentRequest>,
) -> Result<Response, ApiError> {
    let Some((model, action)) = model_action.split_once(':') else {
        return Err(ApiError(GatewayError::InvalidRequest(
            "expected {model}:{action}".to_string(),
        )));
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(ApiError(GatewayError::InvalidRequest(format!(
                "unsupported action: {other}"
            ))));
        }
    };
    let chat = gemini_to_chat(request, model.to_string(), stream);
    let payload = serde_json::to_value(&chat)
        .map_err(|err| ApiError(GatewayError::Internal(err.to_string())))?;
    dispatch(
        state,
        principal,
        trace_id.0,
        ApiType::Gemini,
        payload,
        stream,
    )
    .await
}

async fn dispatch(
    state: GatewayState,
    principal: Principal,
    trace_id: String,
    api_type: ApiType,
    payload: JsonValue,
    stream: bool,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let response = state
        .engine
        .execute(&principal, api_type, payload, stream, trace_id, cancel.clone())
        .await
        .map_err(ApiError)?;
    match response {
        EngineResponse::Json(body) => Ok(Json(body).into_response()),
        EngineResponse::Stream { body } => Ok(sse_response(body, cancel)),
    }
}

/// SSE body whose drop (client gone) cancels the request's token, cascading
/// into the producer, pipe, consumer and the upstream call.
struct GuardedBody {
    inner: ReceiverStream<Bytes>,
    _guard: DropGuard,
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

fn sse_response(body: mpsc::Receiver<Bytes>, cancel: CancellationToken) -> Response {
    let stream = GuardedBody {
        inner: ReceiverStream::new(body),
        _guard: cancel.drop_guard(),
    };
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(sse::CONTENT_TYPE),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(sse::CACHE_CONTROL),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static(sse::CONNECTION),
    );
    headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static(sse::ACCEL_BUFFERING),
    );
    *response.status_mut() = StatusCode::OK;
    response
}
