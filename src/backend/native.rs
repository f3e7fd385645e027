use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::{Value, json};

use crate::backend::error::{BackendError, model_not_found, validation};
use crate::backend::http::{AUX_PROBE_TIMEOUT, HttpClient, HttpConfig, STATUS_PROBE_TIMEOUT};
use crate::backend::kind::{BackendKind, FrameStyle};
use crate::backend::wire::{
    HealthStatus, ModelEntry, VersionInfo, embedding_inputs, models_from_native_tags, now_ms,
};
use crate::backend::{Dispatch, DispatchBody, InferenceAdapter, normalize_base_url};

/// Adapter for the Ollama-style native API.
pub struct NativeAdapter {
    base_url: String,
    http: HttpClient,
}

impl NativeAdapter {
    pub fn new(base_url: &str, config: HttpConfig) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(BackendKind::Native, config),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// OpenAI-style caller paths are rerouted to the backend's own
    /// OpenAI-compatible endpoints, body passed through unchanged.
    fn wants_openai_route(pathname: Option<&str>) -> bool {
        pathname
            .map(|p| p.starts_with("/v1/") || p.starts_with("/openai/"))
            .unwrap_or(false)
    }

    async fn dispatch(
        &self,
        path: &str,
        framing: FrameStyle,
        body: &Value,
        stream: bool,
    ) -> Result<Dispatch, BackendError> {
        let url = self.url(path);
        tracing::debug!(
            target: "backend.native",
            url = %url,
            stream,
            "native_dispatch"
        );
        if stream {
            let (status, _content_type, byte_stream) =
                self.http.open_stream(Method::POST, &url, Some(body)).await?;
            Ok(Dispatch {
                status,
                framing,
                body: DispatchBody::Stream(byte_stream),
            })
        } else {
            let response = self.http.request(Method::POST, &url, Some(body)).await?;
            if !response.is_success() {
                return Err(BackendError::from_status(
                    response.status,
                    &String::from_utf8_lossy(&response.body),
                    BackendKind::Native,
                ));
            }
            Ok(Dispatch {
                status: response.status,
                framing,
                body: DispatchBody::Full(response.body),
            })
        }
    }
}

#[async_trait]
impl InferenceAdapter for NativeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(
        &self,
        body: &Value,
        stream: bool,
        pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        if Self::wants_openai_route(pathname) {
            self.dispatch("/v1/chat/completions", FrameStyle::Sse, body, stream)
                .await
        } else {
            self.dispatch("/api/chat", FrameStyle::Ndjson, body, stream)
                .await
        }
    }

    async fn complete(
        &self,
        body: &Value,
        stream: bool,
        pathname: Option<&str>,
    ) -> Result<Dispatch, BackendError> {
        if Self::wants_openai_route(pathname) {
            self.dispatch("/v1/completions", FrameStyle::Sse, body, stream)
                .await
        } else {
            self.dispatch("/api/generate", FrameStyle::Ndjson, body, stream)
                .await
        }
    }

    async fn check_status(&self) -> bool {
        self.http
            .probe(&self.url("/api/version"), STATUS_PROBE_TIMEOUT)
            .await
    }

    async fn health(&self) -> HealthStatus {
        let started = Instant::now();
        let url = self.url("/api/version");
        match self
            .http
            .request_with_timeout(Method::GET, &url, None, STATUS_PROBE_TIMEOUT)
            .await
        {
            Ok(response) if response.is_success() => {
                let version = response
                    .json()
                    .ok()
                    .and_then(|v| v.get("version").and_then(Value::as_str).map(str::to_string));
                HealthStatus {
                    is_available: true,
                    url: self.base_url.clone(),
                    version,
                    error: None,
                    last_checked: now_ms(),
                    response_time_ms: Some(started.elapsed().as_millis() as u64),
                }
            }
            Ok(response) => HealthStatus::down(
                &self.base_url,
                format!("health probe returned status {}", response.status),
            ),
            Err(err) => HealthStatus::down(&self.base_url, err.to_string()),
        }
    }

    async fn list_models(&self) -> Vec<ModelEntry> {
        let url = self.url("/api/tags");
        match self
            .http
            .request_with_timeout(Method::GET, &url, None, STATUS_PROBE_TIMEOUT)
            .await
        {
            Ok(response) if response.is_success() => match response.json() {
                Ok(body) => models_from_native_tags(&body),
                Err(err) => {
                    tracing::warn!(
                        target: "backend.native",
                        error = %err,
                        "model_list_body_unreadable"
                    );
                    Vec::new()
                }
            },
            Ok(response) => {
                tracing::warn!(
                    target: "backend.native",
                    status = response.status,
                    "model_list_failed"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::debug!(
                    target: "backend.native",
                    error = %err,
                    "model_list_unreachable"
                );
                Vec::new()
            }
        }
    }

    async fn model_info(&self, model: &str) -> Result<ModelEntry, BackendError> {
        let url = self.url("/api/show");
        let response = self
            .http
            .request(Method::POST, &url, Some(&json!({"name": model})))
            .await?;
        if response.status == 404 {
            return Err(model_not_found(model).with_backend(BackendKind::Native));
        }
        if !response.is_success() {
            return Err(BackendError::from_status(
                response.status,
                &String::from_utf8_lossy(&response.body),
                BackendKind::Native,
            ));
        }

        let detail = response.json()?;
        let mut entry = ModelEntry::named(model);
        entry.family = detail
            .get("details")
            .and_then(|d| d.get("family"))
            .and_then(Value::as_str)
            .map(str::to_string);
        entry.parameters = detail
            .get("details")
            .and_then(|d| d.get("parameter_size"))
            .and_then(Value::as_str)
            .map(str::to_string);
        entry.details = detail.get("details").cloned();
        Ok(entry)
    }

    async fn embeddings(&self, body: &Value, style: FrameStyle) -> Result<Value, BackendError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("embeddings request requires a model", vec!["model".into()]))?
            .to_string();
        let url = self.url("/api/embeddings");

        match style {
            // Native body `{model, prompt}`: one call, passed through.
            FrameStyle::Ndjson => {
                let response = self.http.request(Method::POST, &url, Some(body)).await?;
                if !response.is_success() {
                    return Err(BackendError::from_status(
                        response.status,
                        &String::from_utf8_lossy(&response.body),
                        BackendKind::Native,
                    ));
                }
                response.json()
            }
            // OpenAI shape: one backend call per input item, sequential,
            // input order preserved, aggregated into one list response.
            FrameStyle::Sse => {
                let inputs = embedding_inputs(body)?;
                let mut data = Vec::with_capacity(inputs.len());
                for (index, input) in inputs.iter().enumerate() {
                    let response = self
                        .http
                        .request(
                            Method::POST,
                            &url,
                            Some(&json!({"model": model, "prompt": input})),
                        )
                        .await?;
                    if !response.is_success() {
                        return Err(BackendError::from_status(
                            response.status,
                            &String::from_utf8_lossy(&response.body),
                            BackendKind::Native,
                        ));
                    }
                    let parsed = response.json()?;
                    let embedding = parsed
                        .get("embedding")
                        .cloned()
                        .unwrap_or_else(|| Value::Array(Vec::new()));
                    data.push(json!({
                        "object": "embedding",
                        "embedding": embedding,
                        "index": index
                    }));
                }
                Ok(json!({
                    "object": "list",
                    "data": data,
                    "model": model,
                    "usage": {"prompt_tokens": 0, "total_tokens": 0}
                }))
            }
        }
    }

    async fn version(&self) -> VersionInfo {
        let url = self.url("/api/version");
        match self
            .http
            .request_with_timeout(Method::GET, &url, None, AUX_PROBE_TIMEOUT)
            .await
        {
            Ok(response) if response.is_success() => {
                let version = response
                    .json()
                    .ok()
                    .and_then(|v| v.get("version").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                VersionInfo {
                    version,
                    backend: BackendKind::Native,
                }
            }
            _ => VersionInfo::unknown(BackendKind::Native),
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
            .request_with_timeout(
                method,
                &self.url(path),
                body,
                Duration::from_secs(30),
            )
            .await?;
        Ok((response.status, response.body))
    }
}
