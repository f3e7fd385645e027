use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of backend variants the node can federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Ollama-style native API.
    Native,
    /// vLLM-style OpenAI-compatible API.
    OpenAiCompat,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Native, BackendKind::OpenAiCompat];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::OpenAiCompat => "openai_compat",
        }
    }

    /// Value of `MODEL_INFERENCE_FRAMEWORK` selecting this backend.
    pub fn from_framework_token(token: &str) -> Option<BackendKind> {
        match token.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(BackendKind::Native),
            "vllm" => Some(BackendKind::OpenAiCompat),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::Native => "http://127.0.0.1:11434",
            BackendKind::OpenAiCompat => "http://localhost:8000",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::Native => 11434,
            BackendKind::OpenAiCompat => 8000,
        }
    }

    /// Probe path answering cheaply when the backend is up.
    pub fn health_path(&self) -> &'static str {
        match self {
            BackendKind::Native => "/api/version",
            BackendKind::OpenAiCompat => "/v1/models",
        }
    }

    /// Slug used for PID/log files under the system temp directory.
    pub fn service_slug(&self) -> &'static str {
        match self {
            BackendKind::Native => "ollama",
            BackendKind::OpenAiCompat => "vllm",
        }
    }

    /// Fallback default model when the inventory is empty.
    pub fn fallback_model(&self) -> &'static str {
        match self {
            BackendKind::Native => "llama3.2:latest",
            BackendKind::OpenAiCompat => "default",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing the caller expects on the wire, decided by the ingress path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStyle {
    /// Newline-delimited JSON frames (`/api/*` paths).
    Ndjson,
    /// Server-sent events with a `data: [DONE]` trailer (`/v1/*` paths).
    Sse,
}

impl FrameStyle {
    pub fn from_pathname(pathname: &str) -> FrameStyle {
        if pathname.starts_with("/v1/") || pathname.starts_with("/openai/") {
            FrameStyle::Sse
        } else {
            FrameStyle::Ndjson
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FrameStyle::Ndjson => "application/x-ndjson",
            FrameStyle::Sse => "text/event-stream",
        }
    }
}
