use bytes::Bytes;
use serde_json::{Value, json};

use crate::backend::wire::{native_frame_done, now_ms};

pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Serialize one JSON value as an SSE data frame.
pub fn sse_bytes(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

/// Serialize one JSON value as an NDJSON line.
pub fn ndjson_bytes(value: &Value) -> Bytes {
    Bytes::from(format!("{value}\n"))
}

/// Convert one native streaming frame into an OpenAI chat chunk. The role
/// rides only on the first delta; `finish_reason` flips to `"stop"` on the
/// terminal frame.
pub fn native_chat_chunk_to_openai(frame: &Value, model: &str, first: bool) -> Value {
    let done = native_frame_done(frame);
    let content = frame
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut delta = serde_json::Map::new();
    if first {
        delta.insert("role".to_string(), Value::String("assistant".to_string()));
    }
    if !content.is_empty() || !done {
        delta.insert("content".to_string(), Value::String(content.to_string()));
    }

    let created_ms = now_ms();
    json!({
        "id": format!("chatcmpl-{created_ms}"),
        "object": "chat.completion.chunk",
        "created": created_ms / 1000,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": if done { Value::String("stop".to_string()) } else { Value::Null }
        }]
    })
}

/// Convert one native `/api/generate` frame into an OpenAI completion chunk.
pub fn native_completion_chunk_to_openai(frame: &Value, model: &str) -> Value {
    let done = native_frame_done(frame);
    let text = frame
        .get("response")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let created_ms = now_ms();
    json!({
        "id": format!("cmpl-{created_ms}"),
        "object": "text_completion",
        "created": created_ms / 1000,
        "model": model,
        "choices": [{
            "index": 0,
            "text": text,
            "finish_reason": if done { Value::String("stop".to_string()) } else { Value::Null }
        }]
    })
}

/// Wrap a full (non-streaming) native chat response in the OpenAI shape.
pub fn native_chat_response_to_openai(response: &Value, model: &str) -> Value {
    let content = response
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let created_ms = now_ms();
    json!({
        "id": format!("chatcmpl-{created_ms}"),
        "object": "chat.completion",
        "created": created_ms / 1000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": usage_from_native(response)
    })
}

/// Wrap a full native generate response in the OpenAI completion shape.
pub fn native_completion_response_to_openai(response: &Value, model: &str) -> Value {
    let text = response
        .get("response")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let created_ms = now_ms();
    json!({
        "id": format!("cmpl-{created_ms}"),
        "object": "text_completion",
        "created": created_ms / 1000,
        "model": model,
        "choices": [{
            "index": 0,
            "text": text,
            "finish_reason": "stop"
        }],
        "usage": usage_from_native(response)
    })
}

fn usage_from_native(response: &Value) -> Value {
    let prompt = response
        .get("prompt_eval_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = response.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion
    })
}
