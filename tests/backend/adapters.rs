use narval::backend::error::BackendErrorKind;
use narval::backend::http::{HttpClient, HttpConfig};
use narval::backend::kind::{BackendKind, FrameStyle};
use narval::backend::native::NativeAdapter;
use narval::backend::openai::OpenAiCompatAdapter;
use narval::backend::{DispatchBody, InferenceAdapter};
use reqwest::Method;
use serde_json::json;

use crate::support::{json_response, serve_responses};

fn quick_http() -> HttpConfig {
    HttpConfig {
        request_timeout: std::time::Duration::from_secs(5),
        retries: 0,
    }
}

#[tokio::test]
async fn given_tags_response_when_listing_models_then_entries_are_mapped() {
    let (addr, _server) = serve_responses(vec![json_response(
        200,
        r#"{"models":[{"name":"llama3.2:latest","size":7,"digest":"d","details":{"family":"llama","parameter_size":"3B"}}]}"#,
    )])
    .await;

    let adapter = NativeAdapter::new(&format!("http://{addr}"), quick_http());
    let models = adapter.list_models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "llama3.2:latest");
    assert_eq!(models[0].family.as_deref(), Some("llama"));
}

#[tokio::test]
async fn given_unreachable_backend_when_listing_models_then_empty_list_not_error() {
    let adapter = NativeAdapter::new("http://127.0.0.1:9", quick_http());
    assert!(adapter.list_models().await.is_empty());
    assert!(!adapter.check_status().await);
}

#[tokio::test]
async fn given_unreachable_backend_when_reading_version_then_unknown_is_reported() {
    let adapter = NativeAdapter::new("http://127.0.0.1:9", quick_http());
    let version = adapter.version().await;
    assert_eq!(version.version, "unknown");
    assert_eq!(version.backend, BackendKind::Native);
}

#[tokio::test]
async fn given_missing_model_when_fetching_info_then_model_not_found() {
    let (addr, _server) = serve_responses(vec![json_response(404, r#"{"error":"not found"}"#)]).await;
    let adapter = NativeAdapter::new(&format!("http://{addr}"), quick_http());
    let err = adapter
        .model_info("no-such-model")
        .await
        .expect_err("missing model must fail");
    assert_eq!(err.kind, BackendErrorKind::ModelNotFound);
}

#[tokio::test]
async fn given_chat_error_status_when_dispatching_then_upstream_error_is_classified() {
    let (addr, _server) = serve_responses(vec![json_response(422, r#"{"error":"bad"}"#)]).await;
    let adapter = NativeAdapter::new(&format!("http://{addr}"), quick_http());
    let err = adapter
        .chat(
            &json!({"model":"m","messages":[{"role":"user","content":"hi"}]}),
            false,
            None,
        )
        .await
        .expect_err("4xx must surface");
    assert_eq!(err.kind, BackendErrorKind::Upstream4xx);
    assert!(!err.retryable);
}

#[tokio::test]
async fn given_non_stream_chat_when_dispatching_then_body_is_forwarded_verbatim() {
    let body = r#"{"message":{"role":"assistant","content":"hi"},"done":true,"eval_count":2}"#;
    let (addr, _server) = serve_responses(vec![json_response(200, body)]).await;
    let adapter = NativeAdapter::new(&format!("http://{addr}"), quick_http());
    let dispatch = adapter
        .chat(
            &json!({"model":"m","messages":[{"role":"user","content":"hi"}]}),
            false,
            None,
        )
        .await
        .expect("dispatch should succeed");
    assert_eq!(dispatch.framing, FrameStyle::Ndjson);
    match dispatch.body {
        DispatchBody::Full(bytes) => assert_eq!(bytes.as_ref(), body.as_bytes()),
        DispatchBody::Stream(_) => panic!("non-stream dispatch must buffer"),
    }
}

#[tokio::test]
async fn given_openai_pathname_when_dispatching_native_chat_then_v1_route_framing_is_sse() {
    let body = r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#;
    let (addr, _server) = serve_responses(vec![json_response(200, body)]).await;
    let adapter = NativeAdapter::new(&format!("http://{addr}"), quick_http());
    let dispatch = adapter
        .chat(
            &json!({"model":"m","messages":[{"role":"user","content":"hi"}]}),
            false,
            Some("/v1/chat/completions"),
        )
        .await
        .expect("rerouted dispatch should succeed");
    assert_eq!(dispatch.framing, FrameStyle::Sse);
}

#[tokio::test]
async fn given_models_endpoint_when_probing_openai_health_then_synthetic_version_is_reported() {
    let (addr, _server) = serve_responses(vec![
        json_response(200, r#"{"object":"list","data":[{"id":"qwen2","object":"model"}]}"#),
        json_response(200, r#"{"object":"list","data":[{"id":"qwen2","object":"model"}]}"#),
    ])
    .await;
    let adapter = OpenAiCompatAdapter::new(&format!("http://{addr}"), quick_http());

    let health = adapter.health().await;
    assert!(health.is_available);
    assert_eq!(health.version.as_deref(), Some("openai-compat"));

    let models = adapter.list_models().await;
    assert_eq!(models[0].name, "qwen2");
}

#[tokio::test]
async fn given_5xx_then_success_when_requesting_then_client_retries_once() {
    let (addr, _server) = serve_responses(vec![
        json_response(500, r#"{"error":"boom"}"#),
        json_response(200, r#"{"ok":true}"#),
    ])
    .await;
    let client = HttpClient::new(
        BackendKind::Native,
        HttpConfig {
            request_timeout: std::time::Duration::from_secs(5),
            retries: 1,
        },
    );

    let response = client
        .request(Method::GET, &format!("http://{addr}/x"), None)
        .await
        .expect("retry must recover");
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn given_4xx_when_requesting_then_no_retry_is_attempted() {
    // A single canned response: a retry would hang on the second connect.
    let (addr, _server) = serve_responses(vec![json_response(404, r#"{"error":"nope"}"#)]).await;
    let client = HttpClient::new(
        BackendKind::Native,
        HttpConfig {
            request_timeout: std::time::Duration::from_secs(5),
            retries: 3,
        },
    );

    let response = client
        .request(Method::GET, &format!("http://{addr}/x"), None)
        .await
        .expect("4xx is a response, not a transport error");
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn given_streaming_response_when_opening_stream_then_chunks_arrive_in_order() {
    use futures_util::StreamExt;

    let body = "{\"a\":1}\n{\"a\":2}\n";
    let (addr, _server) = serve_responses(vec![json_response(200, body)]).await;
    let client = HttpClient::new(BackendKind::Native, quick_http());

    let (status, _content_type, mut stream) = client
        .open_stream(Method::POST, &format!("http://{addr}/api/chat"), Some(&json!({})))
        .await
        .expect("stream should open");
    assert_eq!(status, 200);

    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.expect("chunks are clean"));
    }
    assert_eq!(collected, body.as_bytes());
}
