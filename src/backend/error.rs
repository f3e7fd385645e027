use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::kind::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Health probe failed or the connection was refused.
    Unavailable,
    /// Backend answered with a 4xx status; never retried.
    Upstream4xx,
    /// Backend answered with a 5xx status; retryable at the HTTP layer.
    Upstream5xx,
    ModelNotFound,
    Validation,
    Protocol,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub backend: Option<BackendKind>,
    /// Offending request paths for validation failures.
    pub paths: Vec<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(
                kind,
                BackendErrorKind::Unavailable
                    | BackendErrorKind::Upstream5xx
                    | BackendErrorKind::Timeout
            ),
            http_status: None,
            backend: None,
            paths: Vec::new(),
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    /// Classify an upstream HTTP status plus (truncated) body.
    pub fn from_status(status: u16, body: &str, backend: BackendKind) -> Self {
        let detail = body.chars().take(240).collect::<String>();
        let mut err = if (400..500).contains(&status) {
            BackendError::new(
                BackendErrorKind::Upstream4xx,
                format!("backend returned status {status}"),
            )
            .with_retryable(false)
        } else {
            BackendError::new(
                BackendErrorKind::Upstream5xx,
                format!("backend returned status {status}"),
            )
            .with_retryable(true)
        };

        err = err.with_status(status).with_backend(backend);
        if !detail.is_empty() {
            err.message = format!("{}: {}", err.message, detail);
        }
        err
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            Some(backend) => write!(f, "{} (backend={})", self.message, backend),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

pub fn unavailable(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorKind::Unavailable, message)
}

pub fn model_not_found(model: impl fmt::Display) -> BackendError {
    BackendError::new(
        BackendErrorKind::ModelNotFound,
        format!("model '{model}' is not present in the backend inventory"),
    )
    .with_retryable(false)
}

pub fn validation(message: impl Into<String>, paths: Vec<String>) -> BackendError {
    BackendError::new(BackendErrorKind::Validation, message)
        .with_retryable(false)
        .with_paths(paths)
}

pub fn protocol(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorKind::Protocol, message).with_retryable(false)
}
