use std::{pin::Pin, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Method, header};
use serde_json::Value;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;

use crate::backend::error::{BackendError, BackendErrorKind};
use crate::backend::kind::BackendKind;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const AUX_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRIES: u32 = 3;

const USER_AGENT: &str = concat!("narval/", env!("CARGO_PKG_VERSION"));

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub request_timeout: Duration,
    pub retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Retrying, timeout-bound HTTP used by every adapter. Retries apply only
/// to connection-level failures and 5xx responses, and never to streams.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
    backend: BackendKind,
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, BackendError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Protocol,
                format!("invalid JSON response body: {err}"),
            )
            .with_retryable(false)
        })
    }
}

impl HttpClient {
    pub fn new(backend: BackendKind, config: HttpConfig) -> Self {
        Self {
            client: Client::builder()
                .pool_idle_timeout(Duration::from_secs(30))
                .user_agent(USER_AGENT)
                .build()
                .expect("reqwest client must build"),
            config,
            backend,
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// One-shot request with the default deadline and retry policy.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, BackendError> {
        self.request_with_timeout(method, url, body, self.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse, BackendError> {
        let mut attempt = 0_u32;
        loop {
            match self.send_once(method.clone(), url, body, timeout).await {
                Ok(response) => {
                    if response.is_success() || !is_retryable_status(response.status) {
                        return Ok(response);
                    }
                    let err = BackendError::from_status(
                        response.status,
                        &String::from_utf8_lossy(&response.body),
                        self.backend,
                    );
                    if attempt >= self.config.retries {
                        return Err(err);
                    }
                    tracing::debug!(
                        target: "backend.http",
                        backend = %self.backend,
                        url,
                        status = response.status,
                        attempt,
                        "retrying_after_upstream_5xx"
                    );
                }
                Err(err) => {
                    if !err.retryable || attempt >= self.config.retries {
                        return Err(err);
                    }
                    tracing::debug!(
                        target: "backend.http",
                        backend = %self.backend,
                        url,
                        attempt,
                        error = %err,
                        "retrying_after_transport_error"
                    );
                }
            }

            attempt += 1;
            sleep(backoff_delay(attempt)).await;
        }
    }

    /// Open a streaming request. No retries: resuming a stream mid-flight
    /// is unsafe. Dropping the returned stream tears the connection down.
    pub async fn open_stream(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Option<String>, ByteStream), BackendError> {
        let mut builder = self
            .client
            .request(method, url)
            .timeout(self.config.request_timeout)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| map_transport_error(&err, self.backend))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body, self.backend));
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, BackendError>>(64);
        let backend = self.backend;
        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            while let Some(item) = upstream.next().await {
                let frame = item.map_err(|err| {
                    BackendError::new(
                        BackendErrorKind::Upstream5xx,
                        format!("stream chunk error: {err}"),
                    )
                    .with_backend(backend)
                });
                let failed = frame.is_err();
                if tx.send(frame).await.is_err() {
                    // Consumer aborted; dropping `upstream` closes the connection.
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        Ok((status, content_type, Box::pin(ReceiverStream::new(rx))))
    }

    /// Health probe: true iff the URL answers 2xx within the given deadline.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse, BackendError> {
        let mut builder = self
            .client
            .request(method, url)
            .timeout(timeout)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| map_transport_error(&err, self.backend))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|err| {
            BackendError::new(
                BackendErrorKind::Upstream5xx,
                format!("failed to read response body: {err}"),
            )
            .with_backend(self.backend)
        })?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// `2^n` seconds, counted from the first retry.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1_u64 << attempt.min(6))
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500
}

fn map_transport_error(err: &reqwest::Error, backend: BackendKind) -> BackendError {
    if err.is_timeout() {
        return BackendError::new(
            BackendErrorKind::Timeout,
            format!("request timed out: {err}"),
        )
        .with_backend(backend);
    }
    if err.is_connect() {
        return BackendError::new(
            BackendErrorKind::Unavailable,
            format!("connection failed: {err}"),
        )
        .with_backend(backend);
    }
    BackendError::new(
        BackendErrorKind::Upstream5xx,
        format!("transport error: {err}"),
    )
    .with_backend(backend)
}
