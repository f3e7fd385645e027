use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::{Value, json};

use crate::backend::error::{BackendError, model_not_found, validation};
use crate::backend::http::{HttpClient, HttpConfig, STATUS_PROBE_TIMEOUT};
use crate::backend::kind::{BackendKind, FrameStyle};
use crate::backend::wire::{
    HealthStatus, ModelEntry, VersionInfo, models_from_openai_list, now_ms,
};
use crate::backend::{Dispatch, DispatchBody, InferenceAdapter, normalize_base_url};

/// Version label reported when `/v1/models` answers: the OpenAI surface
/// has no dedicated version endpoint.
const SYNTHETIC_VERSION: &str = "openai-compat";

/// Adapter for the vLLM-style OpenAI-compatible API.
pub struct OpenAiCompatAdapter {
    base_url: String,
    http: HttpClient,
}

impl OpenAiCompatAdapter {
    pub fn new(base_url: &str, config: HttpConfig) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(BackendKind::OpenAiCompat, config),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn dispatch(
        &self,
        path: &str,
        body: &Value,
        stream: bool,
    ) -> Result<Dispatch, BackendError> {
        let url = self.url(path);
        tracing::debug!(
            target: "backend.openai",
            url = %url,
            stream,
            "openai_dispatch"
        );
        if stream {
            let (status, _content_type, byte_stream) =
                self.http.open_stream(Method::POST, &url, Some(body)).await?;
            Ok(Dispatch {
                status,
                framing: FrameStyle::Sse,
                body: DispatchBody::Stream(byte_stream),
            })
        } else {
            let response = self.http.request(Method::POST, &url, Some(body)).await?;
            if !response.is_success() {
                return Err(BackendError::from_status(
                    response.status,
                    &String::from_utf8_lossy(&response.body),
                    BackendKind::OpenAiCompat,
                ));
            }
            Ok(Dispatch {
                status: response.status,
                framing: FrameStyle::Sse,
                body: DispatchBody::Full(response.body),
            })
        }
    }
}

#[async_trait]
impl InferenceAdapter for OpenAiCompatAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompat
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(
        &self,
        body: &Value,
        stream: bool,
        _pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        self.dispatch("/v1/chat/completions", body, stream).await
    }

    async fn complete(
        &self,
        body: &Value,
        stream: bool,
        _pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        self.dispatch("/v1/completions", body, stream).await
    }

    async fn check_status(&self) -> bool {
        self.http
            .probe(&self.url("/v1/models"), STATUS_PROBE_TIMEOUT)
            .await
    }

    async fn health(&self) -> HealthStatus {
        let started = Instant::now();
        let url = self.url("/v1/models");
        match self
            .http
            .request_with_timeout(Method::GET, &url, None, STATUS_PROBE_TIMEOUT)
            .await
        {
            Ok(response) if response.is_success() => HealthStatus {
                is_available: true,
                url: self.base_url.clone(),
                version: Some(SYNTHETIC_VERSION.to_string()),
                error: None,
                last_checked: now_ms(),
                response_time_ms: Some(started.elapsed().as_millis() as u64),
            },
            Ok(response) => HealthStatus::down(
                &self.base_url,
                format!("health probe returned status {}", response.status),
            ),
            Err(err) => HealthStatus::down(&self.base_url, err.to_string()),
        }
    }

    async fn list_models(&self) -> Vec<ModelEntry> {
        let url = self.url("/v1/models");
        match self
            .http
            .request_with_timeout(Method::GET, &url, None, STATUS_PROBE_TIMEOUT)
            .await
        {
            Ok(response) if response.is_success() => match response.json() {
                Ok(body) => models_from_openai_list(&body),
                Err(err) => {
                    tracing::warn!(
                        target: "backend.openai",
                        error = %err,
                        "model_list_body_unreadable"
                    );
                    Vec::new()
                }
            },
            Ok(response) => {
                tracing::warn!(
                    target: "backend.openai",
                    status = response.status,
                    "model_list_failed"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::debug!(
                    target: "backend.openai",
                    error = %err,
                    "model_list_unreachable"
                );
                Vec::new()
            }
        }
    }

    async fn model_info(&self, model: &str) -> Result<ModelEntry, BackendError> {
        let wanted = ModelEntry::normalized(model);
        let listed = self.list_models().await;
        listed
            .into_iter()
            .find(|entry| ModelEntry::normalized(&entry.name) == wanted)
            .ok_or_else(|| model_not_found(model).with_backend(BackendKind::OpenAiCompat))
    }

    async fn embeddings(&self, body: &Value, _style: FrameStyle) -> Result<Value, BackendError> {
        if body.get("model").and_then(Value::as_str).is_none() {
            return Err(validation(
                "embeddings request requires a model",
                vec!["model".into()],
            ));
        }
        let response = self
            .http
            .request(Method::POST, &self.url("/v1/embeddings"), Some(body))
            .await?;
        if !response.is_success() {
            return Err(BackendError::from_status(
                response.status,
                &String::from_utf8_lossy(&response.body),
                BackendKind::OpenAiCompat,
            ));
        }
        response.json()
    }

    async fn version(&self) -> VersionInfo {
        if self.check_status().await {
            VersionInfo {
                version: SYNTHETIC_VERSION.to_string(),
                backend: BackendKind::OpenAiCompat,
            }
        } else {
            VersionInfo::unknown(BackendKind::OpenAiCompat)
        }
    }

    async fn raw_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Bytes), BackendError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| validation(format!("unsupported method '{method}'"), Vec::new()))?;
        let response = self
            .http
            .request_with_timeout(method, &self.url(path), body, Duration::from_secs(30))
            .await?;
        Ok((response.status, response.body))
    }
}
