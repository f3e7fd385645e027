pub mod error;
pub mod http;
pub mod kind;
pub mod native;
pub mod openai;
pub mod wire;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::backend::error::BackendError;
use crate::backend::http::{ByteStream, HttpConfig};
use crate::backend::kind::{BackendKind, FrameStyle};
use crate::backend::wire::{HealthStatus, ModelEntry, VersionInfo};

/// What an adapter call actually produced, before the proxy decides
/// whether frame normalization is needed.
pub struct Dispatch {
    pub status: u16,
    /// Framing the upstream emitted (not what the caller asked for).
    pub framing: FrameStyle,
    pub body: DispatchBody,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("status", &self.status)
            .field("framing", &self.framing)
            .field("body", &self.body)
            .finish()
    }
}

pub enum DispatchBody {
    /// Non-streaming: the full upstream body, forwarded verbatim.
    Full(Bytes),
    /// Streaming: a finite lazy sequence of byte chunks.
    Stream(ByteStream),
}

impl std::fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            DispatchBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Unified service contract over one backend variant. Adapters hold no
/// per-request state; the `kind` is immutable after construction.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn base_url(&self) -> &str;

    /// Forward a chat call. `pathname` is the caller's original path, used
    /// by the native adapter to reroute OpenAI-style calls to the
    /// backend's own `/v1` endpoints.
    async fn chat(
        &self,
        body: &Value,
        stream: bool,
        pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError>;

    /// Forward a text-completion call.
    async fn complete(
        &self,
        body: &Value,
        stream: bool,
        pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError>;

    /// Cheap availability check; failures are swallowed into `false`.
    async fn check_status(&self) -> bool;

    /// Full health probe with version and latency, for detection reports.
    async fn health(&self) -> HealthStatus;

    /// Inventory listing; failures degrade to an empty list, never an error.
    async fn list_models(&self) -> Vec<ModelEntry>;

    /// Detail for one model; `ModelNotFound` when absent from the inventory.
    async fn model_info(&self, model: &str) -> Result<ModelEntry, BackendError>;

    /// Embeddings; `style` selects the native single-call body or the
    /// OpenAI shape with fan-out over the input array.
    async fn embeddings(&self, body: &Value, style: FrameStyle) -> Result<Value, BackendError>;

    /// Backend version; degrades to `"unknown"` on failure.
    async fn version(&self) -> VersionInfo;

    /// Raw pass-through for paths the unified contract does not model
    /// (`/api/ps`, tunnel proxy_request).
    async fn raw_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Bytes), BackendError>;
}

pub fn build_default_adapters(
    native_url: &str,
    openai_url: &str,
    http_config: HttpConfig,
) -> HashMap<BackendKind, Arc<dyn InferenceAdapter>> {
    let mut adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>> = HashMap::new();
    adapters.insert(
        BackendKind::Native,
        Arc::new(native::NativeAdapter::new(native_url, http_config.clone())),
    );
    adapters.insert(
        BackendKind::OpenAiCompat,
        Arc::new(openai::OpenAiCompatAdapter::new(openai_url, http_config)),
    );
    adapters
}

/// Shared adapter construction: trailing slash stripped once, up front.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
