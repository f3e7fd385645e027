use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::http::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES, HttpConfig};
use crate::backend::kind::BackendKind;
use crate::supervisor::StartOptions;

pub const DEFAULT_HTTP_PORT: u16 = 8716;
const BACKUP_COPIES: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config document is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The persisted configuration document (`<user-config>/narval/config.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub client_type: Option<BackendKind>,
    #[serde(default)]
    pub framework_config: FrameworkConfig,
    #[serde(default)]
    pub resource_config: ResourceConfig,
    #[serde(default)]
    pub gateway_config: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkConfig {
    #[serde(default)]
    pub ollama_url: Option<String>,
    #[serde(default)]
    pub vllm_url: Option<String>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_retries: Option<u32>,
    /// Start options applied when the node supervises vLLM itself.
    #[serde(default)]
    pub vllm: VllmConfig,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            ollama_url: None,
            vllm_url: None,
            request_timeout_ms: None,
            request_retries: None,
            vllm: VllmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VllmConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_model_len: Option<u64>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            restart_on_failure: false,
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Local endpoint of the tunnel transport process (`host:port`).
    #[serde(default)]
    pub tunnel_endpoint: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tunnel_endpoint: None,
            heartbeat_interval_secs: default_heartbeat_secs(),
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_stderr_warn")]
    pub stderr_warn_enabled: bool,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_filter() -> String {
    "info,narval=debug".to_string()
}

fn default_retention_days() -> usize {
    7
}

fn default_stderr_warn() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
            retention_days: default_retention_days(),
            stderr_warn_enabled: default_stderr_warn(),
        }
    }
}

/// `$XDG_CONFIG_HOME/narval/config.json`, falling back through
/// `$HOME/.config` to the working directory.
pub fn default_config_path() -> PathBuf {
    if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(base).join("narval").join("config.json");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("narval")
            .join("config.json");
    }
    PathBuf::from("narval-config.json")
}

/// Durable store behind the document. Writes are atomic
/// (write-temp-then-rename) and keep up to five rotating backups.
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<ConfigDocument>,
}

impl ConfigStore {
    /// A missing file yields the default document; a present-but-broken
    /// file is an error rather than a silent reset.
    pub fn load_or_default(path: &Path) -> Result<ConfigStore, ConfigStoreError> {
        let document = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigDocument::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(ConfigStore {
            path: path.to_path_buf(),
            state: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> ConfigDocument {
        self.state.lock().expect("lock poisoned").clone()
    }

    pub fn client_type(&self) -> Option<BackendKind> {
        self.state.lock().expect("lock poisoned").client_type
    }

    pub fn set_client_type(&self, kind: Option<BackendKind>) -> Result<(), ConfigStoreError> {
        self.update(|document| document.client_type = kind)
    }

    pub fn update<F>(&self, mutate: F) -> Result<(), ConfigStoreError>
    where
        F: FnOnce(&mut ConfigDocument),
    {
        let snapshot = {
            let mut state = self.state.lock().expect("lock poisoned");
            mutate(&mut state);
            state.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, document: &ConfigDocument) -> Result<(), ConfigStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        self.rotate_backups();

        let serialized = serde_json::to_string_pretty(document)?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, serialized)?;
        fs::rename(&temp, &self.path)?;
        tracing::debug!(
            target: "config",
            path = %self.path.display(),
            "config_document_persisted"
        );
        Ok(())
    }

    /// `config.json.bak.1` is the newest copy; older ones shift up and
    /// the sixth falls off.
    fn rotate_backups(&self) {
        if !self.path.exists() {
            return;
        }
        for index in (1..BACKUP_COPIES).rev() {
            let older = backup_path(&self.path, index);
            if older.exists() {
                let _ = fs::rename(&older, backup_path(&self.path, index + 1));
            }
        }
        let _ = fs::copy(&self.path, backup_path(&self.path, 1));
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".bak.{index}"));
    PathBuf::from(os)
}

/// Runtime configuration after merging the document with the
/// environment. Environment wins for the knobs it names.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub ollama_url: String,
    pub vllm_url: String,
    pub http: HttpConfig,
    pub env_default_backend: Option<BackendKind>,
    pub resource: ResourceConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
    pub vllm_start: StartOptions,
}

impl NodeConfig {
    pub fn resolve(document: &ConfigDocument) -> NodeConfig {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let port = env("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);

        let ollama_url = env("OLLAMA_API_URL")
            .or_else(|| document.framework_config.ollama_url.clone())
            .unwrap_or_else(|| BackendKind::Native.default_base_url().to_string());
        let vllm_url = env("VLLM_API_URL")
            .or_else(|| document.framework_config.vllm_url.clone())
            .unwrap_or_else(|| BackendKind::OpenAiCompat.default_base_url().to_string());

        let request_timeout = env("MODEL_REQUEST_TIMEOUT")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .or_else(|| {
                document
                    .framework_config
                    .request_timeout_ms
                    .map(Duration::from_millis)
            })
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let retries = env("MODEL_REQUEST_RETRIES")
            .and_then(|v| v.parse::<u32>().ok())
            .or(document.framework_config.request_retries)
            .unwrap_or(DEFAULT_RETRIES);

        let env_default_backend =
            env("MODEL_INFERENCE_FRAMEWORK").and_then(|v| BackendKind::from_framework_token(&v));

        let vllm = &document.framework_config.vllm;
        let vllm_start = StartOptions {
            binary: None,
            model: vllm.model.clone(),
            host: vllm.host.clone(),
            port: vllm.port,
            gpu_memory_utilization: vllm.gpu_memory_utilization,
            max_model_len: vllm.max_model_len,
            extra_args: vllm.extra_args.clone(),
            restart_on_failure: document.resource_config.restart_on_failure,
            max_restarts: document.resource_config.max_restarts,
        };

        NodeConfig {
            port,
            ollama_url,
            vllm_url,
            http: HttpConfig {
                request_timeout,
                retries,
            },
            env_default_backend,
            resource: document.resource_config.clone(),
            gateway: document.gateway_config.clone(),
            logging: document.logging.clone(),
            vllm_start,
        }
    }
}
