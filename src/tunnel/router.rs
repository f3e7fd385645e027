use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::kind::FrameStyle;
use crate::backend::wire::{SseCursor, SseEvent, NdjsonCursor, native_frame_done, now_ms};
use crate::models::ModelResolver;
use crate::proxy::{ProxyOp, ProxyRequest, SinkFrame, SinkHandle, StreamingProxy, UsageSource};
use crate::registry::BackendRegistry;
use crate::tunnel::message::{
    ContextPingPayload, DeviceRegisterRequest, Envelope, Payload, PingPayload, StreamChunk,
    TaskPayload, TaskResponse, TaskResult, parse_envelope,
};
use crate::tunnel::registration::DeviceRegistration;

pub const GATEWAY_PEER: &str = "gateway";
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const SINK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    /// Outbound channel saturated past the 1 s enqueue deadline.
    Busy,
    /// The write side is gone.
    Closed,
}

#[derive(Debug, Clone)]
pub struct TunnelError {
    pub kind: TunnelErrorKind,
    pub message: String,
}

impl TunnelError {
    fn busy() -> Self {
        Self {
            kind: TunnelErrorKind::Busy,
            message: "tunnel outbound channel is saturated".to_string(),
        }
    }

    fn closed() -> Self {
        Self {
            kind: TunnelErrorKind::Closed,
            message: "tunnel outbound channel is closed".to_string(),
        }
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TunnelError {}

/// Enqueue policy for outbound sends, chosen per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Block until the writer drains (backpressure).
    Block,
    /// Give up with `TunnelBusy` after one second.
    Timeout,
}

/// Which streamed invocation a task id belongs to; picks the response
/// message type and the upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamOp {
    Chat,
    Completion,
    Generate,
}

impl StreamOp {
    fn proxy_op(&self) -> ProxyOp {
        match self {
            StreamOp::Chat => ProxyOp::Chat,
            StreamOp::Completion | StreamOp::Generate => ProxyOp::Completion,
        }
    }

    /// Generation uses native NDJSON framing; the OpenAI-shaped calls
    /// stream SSE and get normalized by the proxy when the backend is
    /// native.
    fn style(&self) -> FrameStyle {
        match self {
            StreamOp::Chat | StreamOp::Completion => FrameStyle::Sse,
            StreamOp::Generate => FrameStyle::Ndjson,
        }
    }

    fn stream_response(&self, chunk: StreamChunk) -> Payload {
        match self {
            StreamOp::Completion => Payload::CompletionResponseStream(chunk),
            StreamOp::Chat | StreamOp::Generate => Payload::ChatResponseStream(chunk),
        }
    }

    fn final_response(&self, result: TaskResult) -> Payload {
        match self {
            StreamOp::Completion => Payload::CompletionResponse(result),
            StreamOp::Chat | StreamOp::Generate => Payload::ChatResponse(result),
        }
    }
}

/// Typed dispatcher over the peer link. Holds the `taskId -> stream`
/// correlation map while responses are in flight; all outbound writes
/// serialize through one bounded channel drained by a single writer.
pub struct TunnelRouter {
    device_id: String,
    outbound: mpsc::Sender<Envelope>,
    streams: Mutex<HashMap<String, CancellationToken>>,
    registry: Arc<BackendRegistry>,
    resolver: Arc<ModelResolver>,
    proxy: Arc<StreamingProxy>,
}

impl TunnelRouter {
    pub fn new(
        device_id: String,
        registry: Arc<BackendRegistry>,
        resolver: Arc<ModelResolver>,
        proxy: Arc<StreamingProxy>,
        outbound_capacity: usize,
    ) -> (Arc<TunnelRouter>, mpsc::Receiver<Envelope>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        (
            Arc::new(TunnelRouter {
                device_id,
                outbound,
                streams: Mutex::new(HashMap::new()),
                registry,
                resolver,
                proxy,
            }),
            outbound_rx,
        )
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.lock().expect("lock poisoned").len()
    }

    pub async fn send(
        &self,
        to: &str,
        payload: Payload,
        policy: SendPolicy,
    ) -> Result<(), TunnelError> {
        let envelope = Envelope {
            from: self.device_id.clone(),
            to: to.to_string(),
            timestamp: Some(now_ms()),
            payload,
        };
        match policy {
            SendPolicy::Block => self
                .outbound
                .send(envelope)
                .await
                .map_err(|_| TunnelError::closed()),
            SendPolicy::Timeout => match self.outbound.send_timeout(envelope, SEND_TIMEOUT).await {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(TunnelError::busy()),
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(TunnelError::closed()),
            },
        }
    }

    /// Introduce the node to the gateway.
    pub async fn register(&self, registration: &DeviceRegistration) -> Result<(), TunnelError> {
        self.send(
            GATEWAY_PEER,
            Payload::DeviceRegisterRequest(DeviceRegisterRequest {
                device_id: registration.device_id.clone(),
                device_name: registration.device_name.clone(),
                gateway_address: registration.gateway_address.clone(),
                reward_address: registration.reward_address.clone(),
                code: registration.code.clone(),
            }),
            SendPolicy::Block,
        )
        .await
    }

    /// Publish the current backend's inventory.
    pub async fn report_models(&self) -> Result<(), TunnelError> {
        let backend = self.registry.current_backend();
        let models = self.resolver.models(backend).await;
        self.send(
            GATEWAY_PEER,
            Payload::DeviceModelReport(crate::tunnel::message::DeviceModelReport {
                device_id: self.device_id.clone(),
                models,
            }),
            SendPolicy::Block,
        )
        .await
    }

    /// One line off the peer link. Malformed envelopes are logged and
    /// dropped, never surfaced to the peer.
    pub async fn handle_line(self: &Arc<Self>, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_envelope(line) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(err) => {
                tracing::warn!(
                    target: "tunnel.router",
                    error = %err,
                    "dropping_malformed_envelope"
                );
            }
        }
    }

    pub async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let from = envelope.from.clone();
        match envelope.payload {
            Payload::Ping(_) => {
                let _ = self
                    .send(
                        &from,
                        Payload::Pong(PingPayload { timestamp: now_ms() }),
                        SendPolicy::Timeout,
                    )
                    .await;
            }
            Payload::ContextPing(ping) => {
                let _ = self
                    .send(
                        &from,
                        Payload::ContextPong(ContextPingPayload {
                            request_id: ping.request_id,
                            timestamp: now_ms(),
                        }),
                        SendPolicy::Timeout,
                    )
                    .await;
            }
            Payload::Pong(_)
            | Payload::ContextPong(_)
            | Payload::DeviceRegisterResponse(_)
            | Payload::DeviceRegisterAck(_)
            | Payload::DeviceModelResponse(_)
            | Payload::DeviceHeartbeatResponse(_) => {
                tracing::debug!(
                    target: "tunnel.router",
                    message_type = envelope.payload.type_name(),
                    "peer_response_received"
                );
            }
            Payload::ChatRequestStream(payload) => {
                self.spawn_stream(from, payload, StreamOp::Chat);
            }
            Payload::CompletionRequestStream(payload) => {
                self.spawn_stream(from, payload, StreamOp::Completion);
            }
            Payload::GenerateRequestStream(payload) => {
                self.spawn_stream(from, payload, StreamOp::Generate);
            }
            Payload::ChatRequestNoStream(payload) => {
                self.spawn_oneshot(from, payload, StreamOp::Chat);
            }
            Payload::CompletionRequestNoStream(payload) => {
                self.spawn_oneshot(from, payload, StreamOp::Completion);
            }
            Payload::GenerateRequestNoStream(payload) => {
                self.spawn_oneshot(from, payload, StreamOp::Generate);
            }
            Payload::TaskRequest(request) => {
                self.spawn_task_request(from, request);
            }
            Payload::ProxyRequest(call) => {
                let router = self.clone();
                tokio::spawn(async move {
                    let adapter = router.registry.current_adapter();
                    let (status, body) = match adapter
                        .raw_request(&call.method, &call.path, call.body.as_ref())
                        .await
                    {
                        Ok((status, bytes)) => (
                            status,
                            serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| {
                                Value::String(String::from_utf8_lossy(&bytes).to_string())
                            }),
                        ),
                        Err(err) => (
                            crate::proxy::http_status(err.kind),
                            crate::proxy::error_body(&err),
                        ),
                    };
                    let _ = router
                        .send(
                            &from,
                            Payload::TaskResponse(TaskResponse {
                                task_id: call.task_id,
                                status,
                                body,
                            }),
                            SendPolicy::Block,
                        )
                        .await;
                });
            }
            // The node serves; response frames only arrive here for
            // streams that have already been torn down. Discard.
            Payload::TaskStream(chunk)
            | Payload::ChatResponseStream(chunk)
            | Payload::CompletionResponseStream(chunk) => {
                tracing::debug!(
                    target: "tunnel.router",
                    task_id = %chunk.task_id,
                    "discarding_chunk_for_closed_stream"
                );
            }
            Payload::ChatResponse(result) | Payload::CompletionResponse(result) => {
                tracing::debug!(
                    target: "tunnel.router",
                    task_id = %result.task_id,
                    "discarding_response_for_closed_stream"
                );
            }
            Payload::TaskResponse(response) => {
                tracing::debug!(
                    target: "tunnel.router",
                    task_id = %response.task_id,
                    "discarding_response_for_closed_stream"
                );
            }
            Payload::DeviceRegisterRequest(_)
            | Payload::DeviceModelReport(_)
            | Payload::DeviceHeartbeatReport(_) => {
                tracing::warn!(
                    target: "tunnel.router",
                    message_type = envelope.payload.type_name(),
                    "unexpected_node_bound_report"
                );
            }
        }
    }

    /// Peer link went away: cancel every in-flight stream. The proxy
    /// observes the sink closure and tears the upstream down within one
    /// chunk boundary.
    pub fn cancel_all(&self) {
        let streams = {
            let mut map = self.streams.lock().expect("lock poisoned");
            std::mem::take(&mut *map)
        };
        for (task_id, token) in streams {
            tracing::debug!(target: "tunnel.router", task_id = %task_id, "cancelling_stream");
            token.cancel();
        }
    }

    pub fn cancel_task(&self, task_id: &str) {
        let token = {
            let mut map = self.streams.lock().expect("lock poisoned");
            map.remove(task_id)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn spawn_stream(self: &Arc<Self>, peer: String, payload: TaskPayload, op: StreamOp) {
        let token = CancellationToken::new();
        {
            let mut map = self.streams.lock().expect("lock poisoned");
            if map.contains_key(&payload.task_id) {
                tracing::warn!(
                    target: "tunnel.router",
                    task_id = %payload.task_id,
                    "duplicate_stream_request_dropped"
                );
                return;
            }
            map.insert(payload.task_id.clone(), token.clone());
        }

        let router = self.clone();
        tokio::spawn(async move {
            let mut body = payload.data.clone();
            if let Value::Object(map) = &mut body {
                map.insert("stream".to_string(), Value::Bool(true));
            }
            let (sink, mut frames) = SinkHandle::channel(SINK_CAPACITY);
            let adapter = router.registry.current_adapter();
            let proxy = router.proxy.clone();
            let request = ProxyRequest {
                op: op.proxy_op(),
                body,
                style: op.style(),
                pathname: None,
                source: UsageSource::Tunnel,
            };

            let dispatch = tokio::spawn(async move { proxy.dispatch(adapter, request, sink).await });

            let mut sse = SseCursor::default();
            let mut ndjson = NdjsonCursor::default();
            let mut sent_done = false;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        // Dropping `frames` closes the sink; the proxy
                        // cancels the upstream request.
                        break;
                    }
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        match frame {
                            SinkFrame::Head(_) => {}
                            SinkFrame::Chunk(bytes) => {
                                let chunks: Vec<(Value, bool)> = match op.style() {
                                    FrameStyle::Sse => sse
                                        .push(&bytes)
                                        .into_iter()
                                        .filter_map(|event| match event {
                                            SseEvent::Data(data) => serde_json::from_str(&data)
                                                .ok()
                                                .map(|value| (value, false)),
                                            SseEvent::Done => Some((Value::Null, true)),
                                        })
                                        .collect(),
                                    FrameStyle::Ndjson => ndjson
                                        .push(&bytes)
                                        .into_iter()
                                        .filter_map(|line| {
                                            serde_json::from_str::<Value>(&line).ok()
                                        })
                                        .map(|frame| {
                                            let done = native_frame_done(&frame);
                                            (frame, done)
                                        })
                                        .collect(),
                                };

                                let mut failed = false;
                                for (chunk, done) in chunks {
                                    let frame = StreamChunk {
                                        task_id: payload.task_id.clone(),
                                        chunk,
                                        done,
                                    };
                                    if done {
                                        sent_done = true;
                                    }
                                    if router
                                        .send(&peer, op.stream_response(frame), SendPolicy::Block)
                                        .await
                                        .is_err()
                                    {
                                        failed = true;
                                        break;
                                    }
                                }
                                if failed {
                                    break;
                                }
                            }
                            SinkFrame::End => {
                                if !sent_done {
                                    let _ = router
                                        .send(
                                            &peer,
                                            op.stream_response(StreamChunk {
                                                task_id: payload.task_id.clone(),
                                                chunk: Value::Null,
                                                done: true,
                                            }),
                                            SendPolicy::Block,
                                        )
                                        .await;
                                }
                                break;
                            }
                        }
                    }
                }
            }

            router
                .streams
                .lock()
                .expect("lock poisoned")
                .remove(&payload.task_id);
            // Close the sink before joining: a cancelled dispatch may be
            // blocked on a sink write.
            drop(frames);
            let _ = dispatch.await;
        });
    }

    fn spawn_oneshot(self: &Arc<Self>, peer: String, payload: TaskPayload, op: StreamOp) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut body = payload.data.clone();
            if let Value::Object(map) = &mut body {
                map.insert("stream".to_string(), Value::Bool(false));
            }
            let (sink, mut frames) = SinkHandle::channel(SINK_CAPACITY);
            let adapter = router.registry.current_adapter();
            let proxy = router.proxy.clone();
            let request = ProxyRequest {
                op: op.proxy_op(),
                body,
                style: op.style(),
                pathname: None,
                source: UsageSource::Tunnel,
            };

            let dispatch = tokio::spawn(async move { proxy.dispatch(adapter, request, sink).await });

            let mut collected = Vec::new();
            while let Some(frame) = frames.recv().await {
                match frame {
                    SinkFrame::Head(_) => {}
                    SinkFrame::Chunk(bytes) => collected.extend_from_slice(&bytes),
                    SinkFrame::End => break,
                }
            }
            drop(frames);
            let _ = dispatch.await;

            let data = serde_json::from_slice::<Value>(&collected).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&collected).to_string())
            });
            let _ = router
                .send(
                    &peer,
                    op.final_response(TaskResult {
                        task_id: payload.task_id,
                        data,
                    }),
                    SendPolicy::Block,
                )
                .await;
        });
    }

    fn spawn_task_request(
        self: &Arc<Self>,
        peer: String,
        request: crate::tunnel::message::TaskRequest,
    ) {
        let op = stream_op_for_path(&request.path);
        let payload = TaskPayload {
            task_id: request.task_id.clone(),
            data: request.body.clone().unwrap_or_else(|| Value::Object(Default::default())),
        };
        match (request.stream, op) {
            (true, Some(op)) => self.spawn_stream(peer, payload, op),
            (false, Some(op)) => self.spawn_oneshot(peer, payload, op),
            (_, None) => {
                // Not a modeled inference path; serve it as a raw proxy call.
                let router = self.clone();
                tokio::spawn(async move {
                    let adapter = router.registry.current_adapter();
                    let method = request.method.as_deref().unwrap_or("POST");
                    let (status, body) = match adapter
                        .raw_request(method, &request.path, request.body.as_ref())
                        .await
                    {
                        Ok((status, bytes)) => (
                            status,
                            serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| {
                                Value::String(String::from_utf8_lossy(&bytes).to_string())
                            }),
                        ),
                        Err(err) => (
                            crate::proxy::http_status(err.kind),
                            crate::proxy::error_body(&err),
                        ),
                    };
                    let _ = router
                        .send(
                            &peer,
                            Payload::TaskResponse(TaskResponse {
                                task_id: request.task_id,
                                status,
                                body,
                            }),
                            SendPolicy::Block,
                        )
                        .await;
                });
            }
        }
    }
}

fn stream_op_for_path(path: &str) -> Option<StreamOp> {
    if path.ends_with("/chat/completions") || path.ends_with("/api/chat") {
        Some(StreamOp::Chat)
    } else if path.ends_with("/v1/completions") {
        Some(StreamOp::Completion)
    } else if path.ends_with("/api/generate") {
        Some(StreamOp::Generate)
    } else {
        None
    }
}
