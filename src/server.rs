use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::backend::error::BackendError;
use crate::backend::kind::FrameStyle;
use crate::node::Node;
use crate::proxy::{
    ProxyOp, ProxyRequest, SinkFrame, SinkHandle, UsageSource, error_body, http_status,
};

const SINK_CAPACITY: usize = 64;

type AppState = State<Arc<Node>>;

pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        // Native wire surface.
        .route("/api/chat", post(api_chat))
        .route("/api/generate", post(api_generate))
        .route("/api/tags", get(api_tags))
        .route("/api/show", post(api_show))
        .route("/api/version", get(api_version))
        .route("/api/embeddings", post(api_embeddings))
        .route("/api/ps", get(api_ps))
        // OpenAI-compatible surface.
        .route("/v1/chat/completions", post(v1_chat_completions))
        .route("/v1/completions", post(v1_completions))
        .route("/v1/models", get(v1_models))
        .route("/v1/embeddings", post(v1_embeddings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(node)
}

/// Readiness of the host process only: backend crashes never affect it.
async fn healthz() -> &'static str {
    "ok"
}

async fn api_chat(state: AppState, Json(body): Json<Value>) -> Response {
    dispatch(state, ProxyOp::Chat, "/api/chat", body).await
}

async fn api_generate(state: AppState, Json(body): Json<Value>) -> Response {
    dispatch(state, ProxyOp::Completion, "/api/generate", body).await
}

async fn v1_chat_completions(state: AppState, Json(body): Json<Value>) -> Response {
    dispatch(state, ProxyOp::Chat, "/v1/chat/completions", body).await
}

async fn v1_completions(state: AppState, Json(body): Json<Value>) -> Response {
    dispatch(state, ProxyOp::Completion, "/v1/completions", body).await
}

/// Shared chat/completion path. The proxy writes everything (headers,
/// payload frames, error envelopes) into the sink; this end re-emits the
/// frames as the HTTP response.
async fn dispatch(
    State(node): AppState,
    op: ProxyOp,
    pathname: &'static str,
    body: Value,
) -> Response {
    let (sink, mut frames) = SinkHandle::channel(SINK_CAPACITY);
    let adapter = node.registry.current_adapter();
    let proxy = node.proxy.clone();
    let request = ProxyRequest {
        op,
        body,
        style: FrameStyle::from_pathname(pathname),
        pathname: Some(pathname.to_string()),
        source: UsageSource::Local,
    };
    tokio::spawn(async move {
        proxy.dispatch(adapter, request, sink).await;
    });

    // First frame is always the head; everything after it is body bytes.
    let head = loop {
        match frames.recv().await {
            Some(SinkFrame::Head(head)) => break head,
            Some(_) => continue,
            None => {
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": {"message": "request aborted before headers"}})),
                )
                    .into_response();
            }
        }
    };

    let stream = futures_util::stream::unfold(frames, |mut frames| async move {
        match frames.recv().await {
            Some(SinkFrame::Chunk(bytes)) => Some((Ok::<Bytes, Infallible>(bytes), frames)),
            _ => None,
        }
    });

    let mut builder = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn api_tags(State(node): AppState) -> Response {
    let backend = node.registry.current_backend();
    let models = node.resolver.models(backend).await;
    Json(json!({"models": models})).into_response()
}

async fn api_show(State(node): AppState, Json(body): Json<Value>) -> Response {
    let name = body
        .get("name")
        .or_else(|| body.get("model"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if name.is_empty() {
        return error_response(&crate::backend::error::validation(
            "model name is required",
            vec!["name".to_string()],
        ));
    }
    match node.registry.current_adapter().model_info(name).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn api_version(State(node): AppState) -> Response {
    let version = node.registry.current_adapter().version().await;
    Json(json!({"version": version.version})).into_response()
}

async fn api_embeddings(State(node): AppState, Json(body): Json<Value>) -> Response {
    embeddings(node, body, FrameStyle::Ndjson).await
}

async fn v1_embeddings(State(node): AppState, Json(body): Json<Value>) -> Response {
    embeddings(node, body, FrameStyle::Sse).await
}

async fn embeddings(node: Arc<Node>, body: Value, style: FrameStyle) -> Response {
    let adapter = node.registry.current_adapter();
    match node
        .proxy
        .embeddings(adapter, &body, style, UsageSource::Local)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Running-model listing is native-only; degraded to an empty list when
/// the backend cannot answer.
async fn api_ps(State(node): AppState) -> Response {
    match node
        .registry
        .current_adapter()
        .raw_request("GET", "/api/ps", None)
        .await
    {
        Ok((status, bytes)) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body: Value = serde_json::from_slice(&bytes).unwrap_or(json!({"models": []}));
            (status, Json(body)).into_response()
        }
        Err(_) => Json(json!({"models": []})).into_response(),
    }
}

async fn v1_models(State(node): AppState) -> Response {
    let backend = node.registry.current_backend();
    let models = node.resolver.models(backend).await;
    let data: Vec<Value> = models
        .iter()
        .map(|entry| {
            json!({
                "id": entry.name,
                "object": "model",
                "owned_by": entry.family.as_deref().unwrap_or("library"),
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

fn error_response(err: &BackendError) -> Response {
    let status =
        StatusCode::from_u16(http_status(err.kind)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_body(err))).into_response()
}
