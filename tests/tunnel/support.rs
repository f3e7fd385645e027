use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use narval::backend::error::{BackendError, model_not_found};
use narval::backend::kind::{BackendKind, FrameStyle};
use narval::backend::wire::{HealthStatus, ModelEntry, VersionInfo, now_ms};
use narval::backend::{Dispatch, DispatchBody, InferenceAdapter};
use narval::config::ConfigStore;
use narval::models::ModelResolver;
use narval::proxy::{StreamingProxy, TaskStore, usage_channel};
use narval::registry::BackendRegistry;
use narval::tunnel::message::Envelope;
use narval::tunnel::router::TunnelRouter;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Backend stand-in: replays native NDJSON frames, optionally holding the
/// stream open so cancellation can be observed.
pub struct ReplayAdapter {
    pub chunks: Vec<&'static [u8]>,
    pub keep_open: bool,
    pub models: Vec<ModelEntry>,
}

impl ReplayAdapter {
    pub fn new(chunks: Vec<&'static [u8]>, keep_open: bool) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            keep_open,
            models: vec![ModelEntry::named("llama3.2:latest")],
        })
    }

    fn stream(&self) -> Dispatch {
        let (tx, rx) = mpsc::channel::<Result<Bytes, BackendError>>(16);
        let chunks = self.chunks.clone();
        let keep_open = self.keep_open;
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(Bytes::from_static(chunk))).await.is_err() {
                    return;
                }
            }
            if keep_open {
                tx.closed().await;
            }
        });
        Dispatch {
            status: 200,
            framing: FrameStyle::Ndjson,
            body: DispatchBody::Stream(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))),
        }
    }
}

#[async_trait]
impl InferenceAdapter for ReplayAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn base_url(&self) -> &str {
        "http://replay"
    }

    async fn chat(
        &self,
        _body: &Value,
        stream: bool,
        _pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        if stream {
            Ok(self.stream())
        } else {
            Ok(Dispatch {
                status: 200,
                framing: FrameStyle::Ndjson,
                body: DispatchBody::Full(Bytes::from_static(
                    b"{\"message\":{\"role\":\"assistant\",\"content\":\"ok\"},\"done\":true,\"eval_count\":1}",
                )),
            })
        }
    }

    async fn complete(
        &self,
        body: &Value,
        stream: bool,
        pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        self.chat(body, stream, pathname).await
    }

    async fn check_status(&self) -> bool {
        true
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            is_available: true,
            url: "http://replay".to_string(),
            version: None,
            error: None,
            last_checked: now_ms(),
            response_time_ms: Some(1),
        }
    }

    async fn list_models(&self) -> Vec<ModelEntry> {
        self.models.clone()
    }

    async fn model_info(&self, model: &str) -> Result<ModelEntry, BackendError> {
        let wanted = ModelEntry::normalized(model);
        self.models
            .iter()
            .find(|entry| ModelEntry::normalized(&entry.name) == wanted)
            .cloned()
            .ok_or_else(|| model_not_found(model))
    }

    async fn embeddings(&self, _body: &Value, _style: FrameStyle) -> Result<Value, BackendError> {
        Ok(serde_json::json!({"object": "list", "data": []}))
    }

    async fn version(&self) -> VersionInfo {
        VersionInfo {
            version: "replay".to_string(),
            backend: BackendKind::Native,
        }
    }

    async fn raw_request(
        &self,
        _method: &str,
        _path: &str,
        _body: Option<&Value>,
    ) -> Result<(u16, Bytes), BackendError> {
        Ok((200, Bytes::from_static(b"{\"models\":[]}")))
    }
}

pub struct TunnelHarness {
    pub router: Arc<TunnelRouter>,
    pub outbound: mpsc::Receiver<Envelope>,
    pub tasks: Arc<TaskStore>,
}

pub fn tunnel_harness(adapter: Arc<ReplayAdapter>, outbound_capacity: usize) -> TunnelHarness {
    let store_path = std::env::temp_dir()
        .join(format!("narval-tunnel-test-{}", Uuid::now_v7()))
        .join("config.json");
    let store = Arc::new(ConfigStore::load_or_default(&store_path).expect("temp store loads"));

    let mut adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>> = HashMap::new();
    adapters.insert(BackendKind::Native, adapter);
    let resolver = Arc::new(ModelResolver::new(adapters.clone()));
    let registry = Arc::new(BackendRegistry::new(adapters, None, store));

    let tasks = Arc::new(TaskStore::new());
    let (usage_tx, _usage_handle) = usage_channel(64);
    let proxy = Arc::new(StreamingProxy::new(
        tasks.clone(),
        resolver.clone(),
        usage_tx,
        Some("dev-under-test".to_string()),
    ));

    let (router, outbound) =
        TunnelRouter::new("dev-under-test".to_string(), registry, resolver, proxy, outbound_capacity);
    TunnelHarness {
        router,
        outbound,
        tasks,
    }
}
