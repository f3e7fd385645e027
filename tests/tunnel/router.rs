use std::time::Duration;

use narval::proxy::TaskState;
use narval::tunnel::message::{Envelope, Payload, PingPayload, StreamChunk, TaskPayload};
use narval::tunnel::router::SendPolicy;
use narval::tunnel::TunnelErrorKind;
use serde_json::json;
use tokio::time::timeout;

use crate::support::{ReplayAdapter, tunnel_harness};

const NATIVE_FRAMES: [&[u8]; 2] = [
    b"{\"message\":{\"role\":\"assistant\",\"content\":\"hi\"},\"done\":false}\n",
    b"{\"message\":{\"content\":\"\"},\"done\":true,\"eval_count\":3}\n",
];

fn envelope(payload: Payload) -> Envelope {
    Envelope {
        from: "gateway".to_string(),
        to: "dev-under-test".to_string(),
        timestamp: Some(1),
        payload,
    }
}

async fn next_outbound(
    rx: &mut tokio::sync::mpsc::Receiver<Envelope>,
) -> Option<Envelope> {
    timeout(Duration::from_secs(5), rx.recv()).await.ok()?
}

#[tokio::test]
async fn given_ping_then_pong_is_returned_to_the_sender() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let mut h = tunnel_harness(adapter, 16);

    h.router
        .handle_envelope(envelope(Payload::Ping(PingPayload { timestamp: 1 })))
        .await;

    let reply = next_outbound(&mut h.outbound).await.expect("pong expected");
    assert_eq!(reply.to, "gateway");
    assert!(matches!(reply.payload, Payload::Pong(_)));
}

#[tokio::test]
async fn given_context_ping_then_pong_echoes_the_request_id() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let mut h = tunnel_harness(adapter, 16);

    h.router
        .handle_line(
            r#"{"type":"context-ping","from":"gateway","to":"dev-under-test","payload":{"requestId":"r-77","timestamp":9}}"#,
        )
        .await;

    let reply = next_outbound(&mut h.outbound).await.expect("context-pong expected");
    match reply.payload {
        Payload::ContextPong(pong) => assert_eq!(pong.request_id, "r-77"),
        other => panic!("expected context-pong, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn given_malformed_line_then_nothing_is_emitted() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let mut h = tunnel_harness(adapter, 16);

    h.router.handle_line(r#"{"type":"launch_missiles","from":"gw","to":"n","payload":{}}"#).await;
    h.router.handle_line("not json at all").await;

    let quiet = timeout(Duration::from_millis(200), h.outbound.recv()).await;
    assert!(quiet.is_err(), "malformed envelopes are dropped silently");
}

#[tokio::test]
async fn given_chat_request_stream_then_chunks_and_done_flow_back_in_order() {
    let adapter = ReplayAdapter::new(NATIVE_FRAMES.to_vec(), false);
    let mut h = tunnel_harness(adapter, 64);

    h.router
        .handle_envelope(envelope(Payload::ChatRequestStream(TaskPayload {
            task_id: "task_9_gwstream1".to_string(),
            data: json!({
                "model": "llama3.2:latest",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        })))
        .await;

    let mut chunks = Vec::new();
    loop {
        let reply = next_outbound(&mut h.outbound)
            .await
            .expect("stream frames expected");
        match reply.payload {
            Payload::ChatResponseStream(chunk) => {
                assert_eq!(chunk.task_id, "task_9_gwstream1");
                let done = chunk.done;
                chunks.push(chunk);
                if done {
                    break;
                }
            }
            other => panic!("unexpected message {}", other.type_name()),
        }
    }

    // Both native frames were normalized into OpenAI chunks before the
    // closing frame.
    assert!(chunks.len() >= 2);
    assert_eq!(
        chunks[0].chunk["choices"][0]["delta"]["content"],
        "hi"
    );
    assert!(chunks.last().unwrap().done);

    // The stream entry is gone once the stream finishes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.router.active_stream_count(), 0);
}

#[tokio::test]
async fn given_cancel_mid_stream_then_no_further_chunks_for_the_task() {
    let adapter = ReplayAdapter::new(vec![NATIVE_FRAMES[0]], true);
    let mut h = tunnel_harness(adapter, 64);

    h.router
        .handle_envelope(envelope(Payload::ChatRequestStream(TaskPayload {
            task_id: "task_9_cancelme1".to_string(),
            data: json!({
                "model": "llama3.2:latest",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        })))
        .await;

    // First chunk proves the stream is live.
    let first = next_outbound(&mut h.outbound).await.expect("first chunk");
    assert!(matches!(first.payload, Payload::ChatResponseStream(_)));
    assert_eq!(h.router.active_stream_count(), 1);

    // Gateway hangs up.
    h.router.cancel_all();

    // Allow teardown, then assert silence and a failed task.
    let mut trailing = Vec::new();
    while let Ok(Some(envelope)) = timeout(Duration::from_millis(300), h.outbound.recv()).await {
        trailing.push(envelope);
    }
    let late_chunks = trailing
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                Payload::ChatResponseStream(StreamChunk { done: false, .. })
            )
        })
        .count();
    assert_eq!(late_chunks, 0, "no payload chunks after cancellation");
    assert_eq!(h.router.active_stream_count(), 0);

    // The dispatch observed the sink closure; its task must end failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tasks = h.tasks.snapshot();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Failed);
}

#[tokio::test]
async fn given_chat_request_no_stream_then_single_response_carries_the_wrapped_body() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let mut h = tunnel_harness(adapter, 16);

    h.router
        .handle_envelope(envelope(Payload::ChatRequestNoStream(TaskPayload {
            task_id: "task_9_oneshot01".to_string(),
            data: json!({
                "model": "llama3.2:latest",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        })))
        .await;

    let reply = next_outbound(&mut h.outbound).await.expect("response expected");
    match reply.payload {
        Payload::ChatResponse(result) => {
            assert_eq!(result.task_id, "task_9_oneshot01");
            // SSE-style caller framing wraps the native body.
            assert_eq!(result.data["object"], "chat.completion");
            assert_eq!(result.data["choices"][0]["message"]["content"], "ok");
        }
        other => panic!("unexpected message {}", other.type_name()),
    }
}

#[tokio::test]
async fn given_saturated_outbound_then_timeout_policy_reports_busy() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let h = tunnel_harness(adapter, 1);

    h.router
        .send("gateway", Payload::Ping(PingPayload { timestamp: 1 }), SendPolicy::Timeout)
        .await
        .expect("first send fits the channel");

    let err = h
        .router
        .send("gateway", Payload::Ping(PingPayload { timestamp: 2 }), SendPolicy::Timeout)
        .await
        .expect_err("second send must hit the 1s deadline");
    assert_eq!(err.kind, TunnelErrorKind::Busy);
}

#[tokio::test]
async fn given_proxy_request_then_task_response_correlates_by_task_id() {
    let adapter = ReplayAdapter::new(Vec::new(), false);
    let mut h = tunnel_harness(adapter, 16);

    h.router
        .handle_envelope(envelope(Payload::ProxyRequest(
            narval::tunnel::message::ProxyCall {
                task_id: "task_9_proxycall".to_string(),
                method: "GET".to_string(),
                path: "/api/ps".to_string(),
                body: None,
            },
        )))
        .await;

    let reply = next_outbound(&mut h.outbound).await.expect("task response expected");
    match reply.payload {
        Payload::TaskResponse(response) => {
            assert_eq!(response.task_id, "task_9_proxycall");
            assert_eq!(response.status, 200);
        }
        other => panic!("unexpected message {}", other.type_name()),
    }
}
