use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::wire::ModelEntry;

/// Envelope carried on the peer link: `{type, from, to, timestamp?,
/// payload}`. The payload shape is fixed per `type`; an unknown `type`
/// fails to parse and the router drops the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Ping(PingPayload),
    Pong(PingPayload),
    #[serde(rename = "context-ping")]
    ContextPing(ContextPingPayload),
    #[serde(rename = "context-pong")]
    ContextPong(ContextPingPayload),
    DeviceRegisterRequest(DeviceRegisterRequest),
    DeviceRegisterResponse(DeviceRegisterResponse),
    DeviceRegisterAck(DeviceRegisterAck),
    DeviceModelReport(DeviceModelReport),
    DeviceModelResponse(AckPayload),
    DeviceHeartbeatReport(HeartbeatReport),
    DeviceHeartbeatResponse(AckPayload),
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    TaskStream(StreamChunk),
    ChatRequestStream(TaskPayload),
    ChatResponseStream(StreamChunk),
    ChatRequestNoStream(TaskPayload),
    ChatResponse(TaskResult),
    CompletionRequestStream(TaskPayload),
    CompletionRequestNoStream(TaskPayload),
    CompletionResponseStream(StreamChunk),
    CompletionResponse(TaskResult),
    GenerateRequestStream(TaskPayload),
    GenerateRequestNoStream(TaskPayload),
    ProxyRequest(ProxyCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPingPayload {
    pub request_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterRequest {
    pub device_id: String,
    pub device_name: String,
    pub gateway_address: String,
    pub reward_address: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterAck {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModelReport {
    pub device_id: String,
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub total_memory_bytes: u64,
    pub cpu_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub device_id: String,
    pub cpu_usage_percent: f32,
    pub memory_usage_percent: f32,
    pub gpu_usage_percent: f32,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub device_info: DeviceInfo,
}

/// Generic remote invocation against the node's backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
    pub status: u16,
    pub body: Value,
}

/// One streamed response frame. `done: true` closes the stream for the
/// task id; `chunk` is null on the closing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub task_id: String,
    pub chunk: Value,
    #[serde(default)]
    pub done: bool,
}

/// Request body for chat/completion/generate invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCall {
    pub task_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Payload {
    /// Correlation id: `payload.taskId`, or `payload.requestId` for
    /// context pings.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Payload::ContextPing(p) | Payload::ContextPong(p) => Some(&p.request_id),
            Payload::TaskRequest(p) => Some(&p.task_id),
            Payload::TaskResponse(p) => Some(&p.task_id),
            Payload::TaskStream(p)
            | Payload::ChatResponseStream(p)
            | Payload::CompletionResponseStream(p) => Some(&p.task_id),
            Payload::ChatRequestStream(p)
            | Payload::ChatRequestNoStream(p)
            | Payload::CompletionRequestStream(p)
            | Payload::CompletionRequestNoStream(p)
            | Payload::GenerateRequestStream(p)
            | Payload::GenerateRequestNoStream(p) => Some(&p.task_id),
            Payload::ChatResponse(p) | Payload::CompletionResponse(p) => Some(&p.task_id),
            Payload::ProxyRequest(p) => Some(&p.task_id),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Ping(_) => "ping",
            Payload::Pong(_) => "pong",
            Payload::ContextPing(_) => "context-ping",
            Payload::ContextPong(_) => "context-pong",
            Payload::DeviceRegisterRequest(_) => "device_register_request",
            Payload::DeviceRegisterResponse(_) => "device_register_response",
            Payload::DeviceRegisterAck(_) => "device_register_ack",
            Payload::DeviceModelReport(_) => "device_model_report",
            Payload::DeviceModelResponse(_) => "device_model_response",
            Payload::DeviceHeartbeatReport(_) => "device_heartbeat_report",
            Payload::DeviceHeartbeatResponse(_) => "device_heartbeat_response",
            Payload::TaskRequest(_) => "task_request",
            Payload::TaskResponse(_) => "task_response",
            Payload::TaskStream(_) => "task_stream",
            Payload::ChatRequestStream(_) => "chat_request_stream",
            Payload::ChatResponseStream(_) => "chat_response_stream",
            Payload::ChatRequestNoStream(_) => "chat_request_no_stream",
            Payload::ChatResponse(_) => "chat_response",
            Payload::CompletionRequestStream(_) => "completion_request_stream",
            Payload::CompletionRequestNoStream(_) => "completion_request_no_stream",
            Payload::CompletionResponseStream(_) => "completion_response_stream",
            Payload::CompletionResponse(_) => "completion_response",
            Payload::GenerateRequestStream(_) => "generate_request_stream",
            Payload::GenerateRequestNoStream(_) => "generate_request_no_stream",
            Payload::ProxyRequest(_) => "proxy_request",
        }
    }
}

pub fn parse_envelope(line: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(line)
}

/// NDJSON encoding for the transport layer.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_string(envelope)?;
    Ok(format!("{encoded}\n"))
}
