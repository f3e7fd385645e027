use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::backend::error::{BackendError, BackendErrorKind};
use crate::backend::kind::FrameStyle;
use crate::backend::wire::{
    IngressSummary, NdjsonCursor, SseCursor, SseEvent, TaskCounters, native_frame_done,
    validate_chat, validate_completion,
};
use crate::backend::{DispatchBody, InferenceAdapter};
use crate::models::ModelResolver;
use crate::proxy::frames;
use crate::proxy::sink::{ResponseHead, SinkHandle};
use crate::proxy::task::{TaskState, TaskStore};
use crate::proxy::usage::{UsageEvent, UsageSender, UsageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOp {
    Chat,
    Completion,
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub op: ProxyOp,
    pub body: Value,
    /// Framing the caller expects, decided by the ingress path or tunnel
    /// message type.
    pub style: FrameStyle,
    /// Original caller pathname, when there was one.
    pub pathname: Option<String>,
    pub source: UsageSource,
}

/// The single place backend error kinds become HTTP status codes.
pub fn http_status(kind: BackendErrorKind) -> u16 {
    match kind {
        BackendErrorKind::Unavailable => 503,
        BackendErrorKind::Upstream4xx => 400,
        BackendErrorKind::Upstream5xx => 502,
        BackendErrorKind::ModelNotFound => 404,
        BackendErrorKind::Validation => 400,
        BackendErrorKind::Protocol => 502,
        BackendErrorKind::Timeout => 504,
        BackendErrorKind::Internal => 500,
    }
}

pub fn error_body(err: &BackendError) -> Value {
    let mut body = json!({
        "error": {
            "message": err.message,
            "type": err.kind,
        }
    });
    if let Some(status) = err.http_status {
        body["error"]["upstream_status"] = json!(status);
    }
    if !err.paths.is_empty() {
        body["error"]["paths"] = json!(err.paths);
    }
    body
}

/// Owns the per-request task lifecycle: create, stream-copy, normalize,
/// account. One instance serves both the local HTTP surface and the
/// tunnel router.
pub struct StreamingProxy {
    tasks: Arc<TaskStore>,
    resolver: Arc<ModelResolver>,
    usage: UsageSender,
    device_id: Option<String>,
}

impl StreamingProxy {
    pub fn new(
        tasks: Arc<TaskStore>,
        resolver: Arc<ModelResolver>,
        usage: UsageSender,
        device_id: Option<String>,
    ) -> Self {
        Self {
            tasks,
            resolver,
            usage,
            device_id,
        }
    }

    pub fn tasks(&self) -> Arc<TaskStore> {
        self.tasks.clone()
    }

    /// Run one chat/completion call to its terminal state, writing every
    /// response byte into `sink`. All errors are written to the sink as
    /// well; pre-dispatch failures never create a running task. Returns
    /// the task id once one exists.
    pub async fn dispatch(
        &self,
        adapter: Arc<dyn InferenceAdapter>,
        request: ProxyRequest,
        sink: SinkHandle,
    ) -> Option<String> {
        let summary = match self.validate(&request) {
            Ok(summary) => summary,
            Err(err) => {
                self.write_error(&sink, &err, false).await;
                return None;
            }
        };

        let task = self
            .tasks
            .create(summary.model.as_deref().unwrap_or(""), self.device_id.as_deref());
        self.tasks.mark_running(&task.id);

        let effective = self
            .resolver
            .effective_model(adapter.kind(), summary.model.as_deref())
            .await;
        let mut body = request.body.clone();
        body["model"] = Value::String(effective.clone());
        self.tasks.update_model(&task.id, &effective);

        tracing::debug!(
            target: "proxy",
            task_id = %task.id,
            backend = %adapter.kind(),
            model = %effective,
            stream = summary.stream,
            "request_dispatched"
        );

        let pathname = request.pathname.as_deref();
        let dispatched = match request.op {
            ProxyOp::Chat => adapter.chat(&body, summary.stream, pathname).await,
            ProxyOp::Completion => adapter.complete(&body, summary.stream, pathname).await,
        };

        let dispatch = match dispatched {
            Ok(dispatch) => dispatch,
            Err(err) => {
                self.write_error(&sink, &err, false).await;
                self.finish(&task.id, TaskState::Failed, None, &effective, request.source);
                return Some(task.id);
            }
        };

        match dispatch.body {
            DispatchBody::Full(bytes) => {
                self.forward_full(
                    &sink,
                    &task.id,
                    &effective,
                    request.op,
                    request.style,
                    dispatch.framing,
                    bytes,
                    request.source,
                )
                .await;
            }
            DispatchBody::Stream(stream) => {
                self.copy_stream(
                    &sink,
                    &task.id,
                    &effective,
                    request.op,
                    request.style,
                    dispatch.framing,
                    stream,
                    request.source,
                )
                .await;
            }
        }

        Some(task.id)
    }

    /// Embeddings carry a task too, but produce one JSON document rather
    /// than a stream; the caller writes the response itself.
    pub async fn embeddings(
        &self,
        adapter: Arc<dyn InferenceAdapter>,
        body: &Value,
        style: FrameStyle,
        source: UsageSource,
    ) -> Result<Value, BackendError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let task = self.tasks.create(&model, self.device_id.as_deref());
        self.tasks.mark_running(&task.id);

        match adapter.embeddings(body, style).await {
            Ok(response) => {
                let counters = response
                    .get("usage")
                    .map(TaskCounters::from_openai_usage)
                    .unwrap_or_default();
                self.finish(&task.id, TaskState::Completed, Some(counters), &model, source);
                Ok(response)
            }
            Err(err) => {
                self.finish(&task.id, TaskState::Failed, None, &model, source);
                Err(err)
            }
        }
    }

    fn validate(&self, request: &ProxyRequest) -> Result<IngressSummary, BackendError> {
        match request.op {
            ProxyOp::Chat => validate_chat(&request.body),
            ProxyOp::Completion => validate_completion(&request.body),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_full(
        &self,
        sink: &SinkHandle,
        task_id: &str,
        model: &str,
        op: ProxyOp,
        wanted: FrameStyle,
        upstream: FrameStyle,
        bytes: Bytes,
        source: UsageSource,
    ) {
        let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();

        let (payload, counters) = match (upstream, wanted, &parsed) {
            // Native response for an OpenAI caller: wrap.
            (FrameStyle::Ndjson, FrameStyle::Sse, Some(native)) => {
                let wrapped = match op {
                    ProxyOp::Chat => frames::native_chat_response_to_openai(native, model),
                    ProxyOp::Completion => {
                        frames::native_completion_response_to_openai(native, model)
                    }
                };
                let counters = TaskCounters::from_native_frame(native);
                (Bytes::from(wrapped.to_string()), Some(counters))
            }
            // Everything else: verbatim forward, counters best effort.
            (FrameStyle::Ndjson, _, Some(native)) => {
                let counters = TaskCounters::from_native_frame(native);
                (bytes, Some(counters))
            }
            (FrameStyle::Sse, _, Some(openai)) => {
                let counters = openai.get("usage").map(TaskCounters::from_openai_usage);
                (bytes, counters)
            }
            _ => (bytes, None),
        };

        let head = ResponseHead::new(200).with_header("content-type", "application/json");
        if sink.send_head(head).await.is_err()
            || sink.send_chunk(payload).await.is_err()
            || sink.end().await.is_err()
        {
            self.finish(task_id, TaskState::Failed, counters, model, source);
            return;
        }
        self.finish(task_id, TaskState::Completed, counters, model, source);
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_stream(
        &self,
        sink: &SinkHandle,
        task_id: &str,
        model: &str,
        op: ProxyOp,
        wanted: FrameStyle,
        upstream_framing: FrameStyle,
        mut upstream: crate::backend::http::ByteStream,
        source: UsageSource,
    ) {
        let head = match wanted {
            FrameStyle::Sse => ResponseHead::new(200)
                .with_header("content-type", FrameStyle::Sse.content_type())
                .with_header("cache-control", "no-cache")
                .with_header("connection", "keep-alive"),
            FrameStyle::Ndjson => ResponseHead::new(200)
                .with_header("content-type", FrameStyle::Ndjson.content_type()),
        };
        if sink.send_head(head).await.is_err() {
            self.finish(task_id, TaskState::Failed, None, model, source);
            return;
        }

        let normalize = upstream_framing == FrameStyle::Ndjson && wanted == FrameStyle::Sse;
        let mut ndjson = NdjsonCursor::default();
        let mut sse = SseCursor::default();
        let mut counters: Option<TaskCounters> = None;
        let mut first_delta = true;
        let mut upstream_sent_done = false;
        let mut failed = false;

        loop {
            tokio::select! {
                _ = sink.closed() => {
                    // Caller disconnect: dropping `upstream` cancels the
                    // backend request within one chunk boundary.
                    tracing::debug!(target: "proxy", task_id, "sink_closed_mid_stream");
                    failed = true;
                    break;
                }
                next = upstream.next() => {
                    let Some(item) = next else { break };
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            tracing::warn!(
                                target: "proxy",
                                task_id,
                                error = %err,
                                "upstream_stream_error"
                            );
                            failed = true;
                            break;
                        }
                    };

                    if normalize {
                        // Re-frame native NDJSON into OpenAI SSE chunks.
                        for line in ndjson.push(&chunk) {
                            let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            if native_frame_done(&frame) {
                                counters = Some(TaskCounters::from_native_frame(&frame));
                            }
                            let converted = match op {
                                ProxyOp::Chat => frames::native_chat_chunk_to_openai(
                                    &frame, model, first_delta,
                                ),
                                ProxyOp::Completion => {
                                    frames::native_completion_chunk_to_openai(&frame, model)
                                }
                            };
                            first_delta = false;
                            if sink.send_chunk(frames::sse_bytes(&converted)).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    } else {
                        // Verbatim copy; sniff counters off to the side.
                        match upstream_framing {
                            FrameStyle::Ndjson => {
                                for line in ndjson.push(&chunk) {
                                    if let Ok(frame) = serde_json::from_str::<Value>(&line) {
                                        if native_frame_done(&frame) {
                                            counters =
                                                Some(TaskCounters::from_native_frame(&frame));
                                        }
                                    }
                                }
                            }
                            FrameStyle::Sse => {
                                for event in sse.push(&chunk) {
                                    match event {
                                        SseEvent::Done => upstream_sent_done = true,
                                        SseEvent::Data(data) => {
                                            if let Ok(frame) =
                                                serde_json::from_str::<Value>(&data)
                                            {
                                                if let Some(usage) = frame.get("usage") {
                                                    counters = Some(
                                                        TaskCounters::from_openai_usage(usage),
                                                    );
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        if sink.send_chunk(chunk).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                }
            }
        }

        if failed {
            // Headers are out; best we can do is stop writing and close.
            let _ = sink.end().await;
            self.finish(task_id, TaskState::Failed, counters, model, source);
            return;
        }

        if wanted == FrameStyle::Sse && !upstream_sent_done {
            let _ = sink.send_chunk(Bytes::from_static(frames::SSE_DONE)).await;
        }
        let _ = sink.end().await;
        self.finish(
            task_id,
            TaskState::Completed,
            Some(counters.unwrap_or_default()),
            model,
            source,
        );
    }

    async fn write_error(&self, sink: &SinkHandle, err: &BackendError, headers_sent: bool) {
        tracing::warn!(target: "proxy", error = %err, "request_failed");
        if headers_sent {
            let _ = sink.end().await;
            return;
        }
        let head = ResponseHead::new(http_status(err.kind))
            .with_header("content-type", "application/json");
        let _ = sink.send_head(head).await;
        let _ = sink
            .send_chunk(Bytes::from(error_body(err).to_string()))
            .await;
        let _ = sink.end().await;
    }

    fn finish(
        &self,
        task_id: &str,
        state: TaskState,
        counters: Option<TaskCounters>,
        model: &str,
        source: UsageSource,
    ) {
        if !self.tasks.finish(task_id, state, counters) {
            return;
        }
        let counters = counters.unwrap_or_default();
        self.usage.emit(UsageEvent {
            task_id: task_id.to_string(),
            device_id: self.device_id.clone(),
            model: model.to_string(),
            prompt_tokens: counters.prompt_eval_count,
            completion_tokens: counters.eval_count,
            completed: state == TaskState::Completed,
            source,
        });
    }
}
