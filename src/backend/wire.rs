use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::error::{BackendError, validation};
use crate::backend::kind::BackendKind;

/// Millisecond epoch "now" used across wire types.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Ingress validation
// ---------------------------------------------------------------------------

/// What the proxy needs to know about an incoming chat/completion body.
/// The raw body itself is forwarded untouched (minus the `model` rewrite),
/// so optional tuning fields stay exactly as the caller sent them.
#[derive(Debug, Clone)]
pub struct IngressSummary {
    pub model: Option<String>,
    pub stream: bool,
}

pub fn validate_chat(body: &Value) -> Result<IngressSummary, BackendError> {
    let mut paths = Vec::new();
    if !body.is_object() {
        return Err(validation(
            "request body must be a JSON object",
            vec!["$".to_string()],
        ));
    }

    match body.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => {
            for (index, message) in messages.iter().enumerate() {
                if message.get("role").and_then(Value::as_str).is_none() {
                    paths.push(format!("messages[{index}].role"));
                }
                if message.get("content").is_none() {
                    paths.push(format!("messages[{index}].content"));
                }
            }
        }
        _ => paths.push("messages".to_string()),
    }

    if let Some(model) = body.get("model") {
        if !model.is_string() {
            paths.push("model".to_string());
        }
    }

    if !paths.is_empty() {
        return Err(validation("chat request failed validation", paths));
    }

    Ok(IngressSummary {
        model: body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty()),
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

pub fn validate_completion(body: &Value) -> Result<IngressSummary, BackendError> {
    let mut paths = Vec::new();
    if !body.is_object() {
        return Err(validation(
            "request body must be a JSON object",
            vec!["$".to_string()],
        ));
    }

    if body.get("prompt").is_none() {
        paths.push("prompt".to_string());
    }
    if let Some(model) = body.get("model") {
        if !model.is_string() {
            paths.push("model".to_string());
        }
    }

    if !paths.is_empty() {
        return Err(validation("completion request failed validation", paths));
    }

    Ok(IngressSummary {
        model: body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty()),
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// OpenAI embeddings `input` accepts a bare string or an array of strings.
pub fn embedding_inputs(body: &Value) -> Result<Vec<String>, BackendError> {
    match body.get("input") {
        Some(Value::String(text)) => Ok(vec![text.clone()]),
        Some(Value::Array(items)) => {
            let mut inputs = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(text) => inputs.push(text.to_string()),
                    None => {
                        return Err(validation(
                            "embeddings input items must be strings",
                            vec![format!("input[{index}]")],
                        ));
                    }
                }
            }
            if inputs.is_empty() {
                return Err(validation(
                    "embeddings input must not be empty",
                    vec!["input".to_string()],
                ));
            }
            Ok(inputs)
        }
        _ => Err(validation(
            "embeddings request requires an input string or array",
            vec!["input".to_string()],
        )),
    }
}

// ---------------------------------------------------------------------------
// Native streaming frames
// ---------------------------------------------------------------------------

/// Usage counters as the native backend reports them on its final frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub load_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub prompt_eval_duration: u64,
    #[serde(default)]
    pub eval_count: u64,
    #[serde(default)]
    pub eval_duration: u64,
}

impl TaskCounters {
    pub fn from_native_frame(frame: &Value) -> TaskCounters {
        TaskCounters {
            total_duration: read_u64(frame, "total_duration"),
            load_duration: read_u64(frame, "load_duration"),
            prompt_eval_count: read_u64(frame, "prompt_eval_count"),
            prompt_eval_duration: read_u64(frame, "prompt_eval_duration"),
            eval_count: read_u64(frame, "eval_count"),
            eval_duration: read_u64(frame, "eval_duration"),
        }
    }

    /// Map an OpenAI `usage` object onto the native counter names.
    pub fn from_openai_usage(usage: &Value) -> TaskCounters {
        TaskCounters {
            prompt_eval_count: read_u64(usage, "prompt_tokens"),
            eval_count: read_u64(usage, "completion_tokens"),
            ..TaskCounters::default()
        }
    }
}

fn read_u64(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// A missing `done` field means the stream is still going.
pub fn native_frame_done(frame: &Value) -> bool {
    frame.get("done").and_then(Value::as_bool).unwrap_or(false)
}

/// Incremental NDJSON line splitter for native stream bodies. Bytes are
/// buffered across chunk boundaries; complete lines come out in order.
#[derive(Debug, Default)]
pub struct NdjsonCursor {
    buffer: String,
}

impl NdjsonCursor {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim_end_matches('\r').to_string();
            self.buffer = self.buffer[idx + 1..].to_string();
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the upstream closes without a trailing newline.
    pub fn finish(self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// SSE `data:` line extractor for OpenAI stream bodies.
#[derive(Debug, Default)]
pub struct SseCursor {
    inner: NdjsonCursor,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

impl SseCursor {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.inner
            .push(chunk)
            .into_iter()
            .filter_map(|line| {
                let data = line.strip_prefix("data:")?.trim();
                if data.is_empty() {
                    None
                } else if data == "[DONE]" {
                    Some(SseEvent::Done)
                } else {
                    Some(SseEvent::Data(data.to_string()))
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Model inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ModelEntry {
    pub fn named(name: impl Into<String>) -> ModelEntry {
        ModelEntry {
            name: name.into(),
            size: None,
            family: None,
            parameters: None,
            modified_at: None,
            digest: None,
            details: None,
        }
    }

    /// Lookup key: trimmed and lowercased. The original string still goes
    /// to the backend untouched.
    pub fn normalized(name: &str) -> String {
        name.trim().to_ascii_lowercase()
    }
}

/// Parse the native `/api/tags` response shape.
pub fn models_from_native_tags(body: &Value) -> Vec<ModelEntry> {
    let Some(models) = body.get("models").and_then(Value::as_array) else {
        return Vec::new();
    };
    models
        .iter()
        .filter_map(|model| {
            let name = model.get("name").and_then(Value::as_str)?;
            let details = model.get("details");
            Some(ModelEntry {
                name: name.to_string(),
                size: model.get("size").and_then(Value::as_u64),
                family: details
                    .and_then(|d| d.get("family"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: details
                    .and_then(|d| d.get("parameter_size"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                modified_at: model
                    .get("modified_at")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                digest: model
                    .get("digest")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                details: details.cloned(),
            })
        })
        .collect()
}

/// Parse the OpenAI `/v1/models` response shape.
pub fn models_from_openai_list(body: &Value) -> Vec<ModelEntry> {
    let Some(models) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    models
        .iter()
        .filter_map(|model| {
            let id = model.get("id").and_then(Value::as_str)?;
            Some(ModelEntry {
                name: id.to_string(),
                size: None,
                family: model
                    .get("owned_by")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: None,
                modified_at: None,
                digest: None,
                details: None,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Health & version
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_available: bool,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_checked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl HealthStatus {
    pub fn down(url: impl Into<String>, error: impl Into<String>) -> HealthStatus {
        HealthStatus {
            is_available: false,
            url: url.into(),
            version: None,
            error: Some(error.into()),
            last_checked: now_ms(),
            response_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub backend: BackendKind,
}

impl VersionInfo {
    pub fn unknown(backend: BackendKind) -> VersionInfo {
        VersionInfo {
            version: "unknown".to_string(),
            backend,
        }
    }
}
