use narval::backend::error::BackendErrorKind;
use narval::backend::kind::FrameStyle;
use narval::proxy::{ProxyOp, ProxyRequest, TaskState, UsageSource};
use serde_json::{Value, json};

use crate::support::{Script, ScriptedAdapter, collect_frames, harness, sink};

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream
    })
}

fn request(op: ProxyOp, body: Value, style: FrameStyle) -> ProxyRequest {
    ProxyRequest {
        op,
        body,
        style,
        pathname: None,
        source: UsageSource::Local,
    }
}

const NATIVE_FRAMES: [&[u8]; 3] = [
    b"{\"message\":{\"role\":\"assistant\",\"content\":\"he\"},\"done\":false}\n",
    b"{\"message\":{\"content\":\"llo\"},\"done\":false}\n",
    b"{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":4,\"eval_count\":2}\n",
];

#[tokio::test]
async fn given_native_stream_for_native_caller_then_chunks_pass_through_untouched() {
    let adapter = ScriptedAdapter::new(
        Script::Stream {
            framing: FrameStyle::Ndjson,
            chunks: NATIVE_FRAMES.to_vec(),
            keep_open: false,
        },
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("llama3.2:latest", true),
                FrameStyle::Ndjson,
            ),
            sink,
        )
        .await
        .expect("task must be created");

    let response = collect_frames(rx).await;
    let head = response.head.expect("head must be written");
    assert_eq!(head.status, 200);
    assert!(
        head.headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "application/x-ndjson")
    );

    // Exactly n upstream chunks, same order, no SSE framing on the wire.
    assert_eq!(response.chunks.len(), NATIVE_FRAMES.len());
    for (chunk, expected) in response.chunks.iter().zip(NATIVE_FRAMES) {
        assert_eq!(chunk.as_ref(), expected);
    }
    assert!(response.ended);

    let task = h.tasks.get(&task_id).expect("task is retained");
    assert_eq!(task.state, TaskState::Completed);
    let counters = task.counters.expect("counters from the done frame");
    assert_eq!(counters.eval_count, 2);
    assert_eq!(counters.prompt_eval_count, 4);
}

#[tokio::test]
async fn given_native_stream_for_openai_caller_then_frames_are_normalized_to_sse() {
    let adapter = ScriptedAdapter::new(
        Script::Stream {
            framing: FrameStyle::Ndjson,
            chunks: NATIVE_FRAMES.to_vec(),
            keep_open: false,
        },
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("llama3.2:latest", true),
                FrameStyle::Sse,
            ),
            sink,
        )
        .await
        .expect("task must be created");

    let response = collect_frames(rx).await;
    let head = response.head.unwrap();
    assert!(
        head.headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "text/event-stream")
    );
    assert!(head.headers.iter().any(|(k, _)| k == "cache-control"));

    let text: String = response
        .chunks
        .iter()
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect();
    let data_frames: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).expect("every frame is valid JSON"))
        .collect();

    assert_eq!(data_frames.len(), NATIVE_FRAMES.len());
    assert_eq!(data_frames[0]["object"], "chat.completion.chunk");
    assert_eq!(data_frames[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(data_frames[0]["choices"][0]["delta"]["content"], "he");
    assert_eq!(data_frames[1]["choices"][0]["delta"]["content"], "llo");
    assert_eq!(
        data_frames.last().unwrap()["choices"][0]["finish_reason"],
        "stop"
    );
    assert!(text.ends_with("data: [DONE]\n\n"));

    assert_eq!(h.tasks.get(&task_id).unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn given_zero_upstream_chunks_then_sse_sink_gets_only_the_terminator() {
    let adapter = ScriptedAdapter::new(
        Script::Stream {
            framing: FrameStyle::Ndjson,
            chunks: Vec::new(),
            keep_open: false,
        },
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("llama3.2:latest", true),
                FrameStyle::Sse,
            ),
            sink,
        )
        .await
        .unwrap();

    let response = collect_frames(rx).await;
    assert_eq!(response.chunks.len(), 1);
    assert_eq!(response.chunks[0].as_ref(), b"data: [DONE]\n\n");
    assert!(response.ended);

    let task = h.tasks.get(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.counters.unwrap().eval_count, 0);
}

#[tokio::test]
async fn given_caller_disconnect_mid_stream_then_task_fails_and_upstream_is_dropped() {
    let adapter = ScriptedAdapter::new(
        Script::Stream {
            framing: FrameStyle::Ndjson,
            chunks: vec![b"{\"message\":{\"content\":\"he\"},\"done\":false}\n"],
            keep_open: true,
        },
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, mut rx) = sink();

    let proxy = h.proxy.clone();
    let dispatch_adapter = adapter.clone();
    let dispatch = tokio::spawn(async move {
        proxy
            .dispatch(
                dispatch_adapter,
                request(
                    ProxyOp::Chat,
                    chat_body("llama3.2:latest", true),
                    FrameStyle::Ndjson,
                ),
                sink,
            )
            .await
    });

    // Head plus the first chunk, then hang up.
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    drop(rx);

    let task_id = dispatch
        .await
        .unwrap()
        .expect("task was created before the disconnect");
    assert_eq!(h.tasks.get(&task_id).unwrap().state, TaskState::Failed);
}

#[tokio::test]
async fn given_invalid_body_then_400_is_written_and_no_task_is_created() {
    let adapter = ScriptedAdapter::new(
        Script::Fail(BackendErrorKind::Internal),
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(ProxyOp::Chat, json!({"model": "m"}), FrameStyle::Sse),
            sink,
        )
        .await;
    assert!(task_id.is_none(), "validation failures never create a task");
    assert!(h.tasks.is_empty());

    let response = collect_frames(rx).await;
    assert_eq!(response.head.unwrap().status, 400);
    let body: Value = serde_json::from_slice(&response.chunks[0]).unwrap();
    assert_eq!(body["error"]["paths"][0], "messages");
    assert!(adapter.seen_bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn given_unavailable_backend_then_503_is_written_and_task_fails() {
    let adapter = ScriptedAdapter::new(
        Script::Fail(BackendErrorKind::Unavailable),
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("llama3.2:latest", false),
                FrameStyle::Sse,
            ),
            sink,
        )
        .await
        .expect("task exists for dispatch failures");

    let response = collect_frames(rx).await;
    assert_eq!(response.head.unwrap().status, 503);
    assert_eq!(h.tasks.get(&task_id).unwrap().state, TaskState::Failed);
}

#[tokio::test]
async fn given_unknown_model_then_default_is_substituted_before_dispatch() {
    let adapter = ScriptedAdapter::new(
        Script::Full {
            framing: FrameStyle::Ndjson,
            body: b"{\"message\":{\"content\":\"ok\"},\"done\":true}",
        },
        &["real-model"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("no-such-model", false),
                FrameStyle::Ndjson,
            ),
            sink,
        )
        .await
        .unwrap();
    collect_frames(rx).await;

    let forwarded = adapter.seen_bodies.lock().unwrap();
    assert_eq!(forwarded[0]["model"], "real-model");
    assert_eq!(h.tasks.get(&task_id).unwrap().model, "real-model");
}

#[tokio::test]
async fn given_full_native_response_for_openai_caller_then_body_is_wrapped() {
    let adapter = ScriptedAdapter::new(
        Script::Full {
            framing: FrameStyle::Ndjson,
            body: b"{\"message\":{\"role\":\"assistant\",\"content\":\"hello\"},\"done\":true,\"prompt_eval_count\":3,\"eval_count\":5}",
        },
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);
    let (sink, rx) = sink();

    let task_id = h
        .proxy
        .dispatch(
            adapter.clone(),
            request(
                ProxyOp::Chat,
                chat_body("llama3.2:latest", false),
                FrameStyle::Sse,
            ),
            sink,
        )
        .await
        .unwrap();

    let response = collect_frames(rx).await;
    let body: Value = serde_json::from_slice(&response.chunks[0]).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["usage"]["completion_tokens"], 5);

    let task = h.tasks.get(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.counters.unwrap().prompt_eval_count, 3);
}

#[tokio::test]
async fn given_embeddings_call_then_task_completes_with_usage_counters() {
    let adapter = ScriptedAdapter::new(
        Script::Fail(BackendErrorKind::Internal),
        &["llama3.2:latest"],
    );
    let h = harness(&adapter);

    let response = h
        .proxy
        .embeddings(
            adapter.clone(),
            &json!({"model": "llama3.2:latest", "input": "hello"}),
            FrameStyle::Sse,
            UsageSource::Local,
        )
        .await
        .expect("scripted embeddings succeed");
    assert_eq!(response["object"], "list");

    assert_eq!(h.tasks.len(), 1);
}
