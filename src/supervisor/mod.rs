pub mod metrics;
pub mod pidfile;
pub mod port;

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::Mutex, time::sleep};

use crate::backend::http::{HttpClient, HttpConfig};
use crate::backend::kind::BackendKind;
use metrics::MetricsSampler;
use pidfile::{log_file_path, pid_file_path, read_pid, remove_pid, write_pid};

const READINESS_DEADLINE: Duration = Duration::from_secs(30);
const READINESS_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(10);
const RESTART_PAUSE: Duration = Duration::from_secs(2);

pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Signal 0 probes for process existence without delivering anything.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartOptions {
    /// Override the backend binary on PATH.
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_model_len: Option<u64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl StartOutcome {
    fn ok(message: impl Into<String>, pid: u32) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            pid: Some(pid),
        }
    }

    fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error,
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub backend: BackendKind,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub http_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct SupervisorState {
    phase: Phase,
    current_pid: Option<u32>,
    start_time: Option<Instant>,
    restart_count: u32,
    failure_restarts: u32,
    config: Option<StartOptions>,
    /// Bumped on every start; stale watchers compare and bail.
    generation: u64,
}

/// Lifecycle manager for one backend binary. Exclusively owns its child
/// process and PID file.
pub struct ProcessSupervisor {
    kind: BackendKind,
    health_url: String,
    http: HttpClient,
    sampler: Arc<MetricsSampler>,
    pid_file: PathBuf,
    log_file: PathBuf,
    state: Mutex<SupervisorState>,
    me: std::sync::Weak<ProcessSupervisor>,
}

impl ProcessSupervisor {
    pub fn new(
        kind: BackendKind,
        base_url: &str,
        sampler: Arc<MetricsSampler>,
    ) -> Arc<ProcessSupervisor> {
        let pid_file = pid_file_path(kind);
        let log_file = log_file_path(kind);
        let health_url = format!("{}{}", base_url.trim_end_matches('/'), kind.health_path());

        // Reclaim a child that survived a host-process recycle.
        let (phase, current_pid, start_time) = match read_pid(&pid_file) {
            Some(pid) if pid_alive(pid) => {
                tracing::info!(
                    target: "supervisor",
                    backend = %kind,
                    pid,
                    "reclaimed_running_backend_from_pid_file"
                );
                (Phase::Running, Some(pid), Some(Instant::now()))
            }
            Some(_) => {
                remove_pid(&pid_file);
                (Phase::Stopped, None, None)
            }
            None => (Phase::Stopped, None, None),
        };

        Arc::new_cyclic(|me| ProcessSupervisor {
            kind,
            health_url,
            http: HttpClient::new(kind, HttpConfig::default()),
            sampler,
            pid_file,
            log_file,
            state: Mutex::new(SupervisorState {
                phase,
                current_pid,
                start_time,
                restart_count: 0,
                failure_restarts: 0,
                config: None,
                generation: 0,
            }),
            me: me.clone(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Spawn the backend and wait for it to become ready. Refused while a
    /// child is already running or starting.
    pub async fn start(&self, opts: StartOptions) -> StartOutcome {
        let generation = {
            let mut state = self.state.lock().await;
            match state.phase {
                Phase::Running | Phase::Starting => {
                    return StartOutcome::failure(
                        format!("{} backend is already running", self.kind),
                        None,
                    );
                }
                Phase::Stopping => {
                    return StartOutcome::failure(
                        format!("{} backend is still stopping", self.kind),
                        None,
                    );
                }
                Phase::Stopped => {}
            }
            state.phase = Phase::Starting;
            state.generation += 1;
            state.generation
        };

        let mut child = match self.spawn_child(&opts).await {
            Ok(child) => child,
            Err(err) => {
                let mut state = self.state.lock().await;
                state.phase = Phase::Stopped;
                tracing::error!(
                    target: "supervisor",
                    backend = %self.kind,
                    error = %err,
                    "backend_spawn_failed"
                );
                return StartOutcome::failure(
                    format!("failed to spawn {} backend", self.kind),
                    Some(err),
                );
            }
        };

        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            let mut state = self.state.lock().await;
            state.phase = Phase::Stopped;
            return StartOutcome::failure("spawned child has no pid", None);
        };

        if let Err(err) = write_pid(&self.pid_file, pid) {
            tracing::warn!(
                target: "supervisor",
                backend = %self.kind,
                error = %err,
                "pid_file_write_failed"
            );
        }

        tracing::info!(
            target: "supervisor",
            backend = %self.kind,
            pid,
            log_file = %self.log_file.display(),
            "backend_spawned"
        );

        // Readiness probe: poll the health endpoint every second for up
        // to 30 s.
        let deadline = Instant::now() + READINESS_DEADLINE;
        let mut ready = false;
        while Instant::now() < deadline {
            if self.http.probe(&self.health_url, READINESS_INTERVAL).await {
                ready = true;
                break;
            }
            sleep(READINESS_INTERVAL).await;
        }

        if !ready {
            let _ = child.start_kill();
            let _ = child.wait().await;
            remove_pid(&self.pid_file);
            let mut state = self.state.lock().await;
            state.phase = Phase::Stopped;
            state.current_pid = None;
            state.start_time = None;
            return StartOutcome::failure(
                format!(
                    "{} backend did not become ready within {}s",
                    self.kind,
                    READINESS_DEADLINE.as_secs()
                ),
                None,
            );
        }

        {
            let mut state = self.state.lock().await;
            state.phase = Phase::Running;
            state.current_pid = Some(pid);
            state.start_time = Some(Instant::now());
            state.config = Some(opts);
        }

        self.spawn_watcher(child, generation);
        tracing::info!(target: "supervisor", backend = %self.kind, pid, "backend_ready");
        StartOutcome::ok(format!("{} backend is running", self.kind), pid)
    }

    /// SIGTERM, wait up to 10 s, then SIGKILL. Idempotent when stopped.
    pub async fn stop(&self) -> StopOutcome {
        let pid = {
            let mut state = self.state.lock().await;
            match (state.phase, state.current_pid) {
                (Phase::Running, Some(pid)) | (Phase::Starting, Some(pid)) => {
                    state.phase = Phase::Stopping;
                    pid
                }
                _ => {
                    return StopOutcome {
                        success: true,
                        message: format!("{} backend is not running", self.kind),
                    };
                }
            }
        };

        send_signal(pid, libc::SIGTERM);
        let deadline = Instant::now() + STOP_GRACE;
        while pid_alive(pid) && Instant::now() < deadline {
            sleep(Duration::from_millis(250)).await;
        }
        if pid_alive(pid) {
            tracing::warn!(
                target: "supervisor",
                backend = %self.kind,
                pid,
                "graceful_stop_timed_out_sending_sigkill"
            );
            send_signal(pid, libc::SIGKILL);
        }

        remove_pid(&self.pid_file);
        let mut state = self.state.lock().await;
        state.phase = Phase::Stopped;
        state.current_pid = None;
        state.start_time = None;
        tracing::info!(target: "supervisor", backend = %self.kind, pid, "backend_stopped");
        StopOutcome {
            success: true,
            message: format!("{} backend stopped", self.kind),
        }
    }

    /// Stop, pause 2 s, start with the remembered config (or an override).
    pub async fn restart(&self, opts: Option<StartOptions>) -> StartOutcome {
        let remembered = {
            let state = self.state.lock().await;
            state.config.clone()
        };
        let opts = opts.or(remembered).unwrap_or_default();

        self.stop().await;
        sleep(RESTART_PAUSE).await;
        let outcome = self.start(opts).await;
        if outcome.success {
            let mut state = self.state.lock().await;
            state.restart_count += 1;
        }
        outcome
    }

    /// Three facts combined: PID liveness, HTTP reachability, sampled
    /// resource metrics. Dead PID with reachable HTTP means an externally
    /// launched backend: running, no PID.
    pub async fn status(&self) -> SupervisorStatus {
        let (pid, start_time, restart_count) = {
            let state = self.state.lock().await;
            (state.current_pid, state.start_time, state.restart_count)
        };

        let alive = pid.map(pid_alive).unwrap_or(false);
        let http_reachable = self
            .http
            .probe(&self.health_url, Duration::from_secs(5))
            .await;

        if pid.is_some() && !alive {
            // Child died underneath us; reconcile bookkeeping now.
            remove_pid(&self.pid_file);
            let mut state = self.state.lock().await;
            if state.current_pid == pid {
                state.phase = Phase::Stopped;
                state.current_pid = None;
                state.start_time = None;
            }
        }

        let metrics = pid
            .filter(|_| alive)
            .and_then(|pid| self.sampler.sample_process(pid));

        SupervisorStatus {
            backend: self.kind,
            is_running: alive || http_reachable,
            pid: pid.filter(|_| alive),
            http_reachable,
            uptime_ms: start_time
                .filter(|_| alive)
                .map(|t| t.elapsed().as_millis() as u64),
            restart_count,
            memory_bytes: metrics.map(|m| m.memory_bytes),
            cpu_percent: metrics.map(|m| m.cpu_percent),
        }
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state.phase == Phase::Running
    }

    async fn spawn_child(&self, opts: &StartOptions) -> Result<tokio::process::Child, String> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|err| format!("cannot open log file: {err}"))?;
        let log_err = log
            .try_clone()
            .map_err(|err| format!("cannot clone log handle: {err}"))?;

        let mut command = match self.kind {
            BackendKind::Native => {
                let binary = opts.binary.clone().unwrap_or_else(|| "ollama".to_string());
                let mut command = Command::new(binary);
                command.arg("serve");
                command
            }
            BackendKind::OpenAiCompat => {
                let binary = opts.binary.clone().unwrap_or_else(|| "vllm".to_string());
                let mut command = Command::new(binary);
                command.arg("serve");
                if let Some(model) = &opts.model {
                    command.arg("--model").arg(model);
                }
                if let Some(gpu) = opts.gpu_memory_utilization {
                    command.arg("--gpu-memory-utilization").arg(gpu.to_string());
                }
                if let Some(len) = opts.max_model_len {
                    command.arg("--max-model-len").arg(len.to_string());
                }
                let port = match opts.port {
                    Some(port) => Some(port),
                    None => port::next_available_port(self.kind.default_port()).await,
                };
                if let Some(port) = port {
                    command.arg("--port").arg(port.to_string());
                }
                command
                    .arg("--host")
                    .arg(opts.host.as_deref().unwrap_or("0.0.0.0"));
                for arg in &opts.extra_args {
                    command.arg(arg);
                }
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(false);

        command.spawn().map_err(|err| err.to_string())
    }

    fn spawn_watcher(&self, mut child: tokio::process::Child, generation: u64) {
        let Some(me) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            let status = child.wait().await;
            let restart_config = {
                let mut state = me.state.lock().await;
                if state.generation != generation || state.phase == Phase::Stopping {
                    // An orderly stop (or a newer start) already owns cleanup.
                    return;
                }
                tracing::warn!(
                    target: "supervisor",
                    backend = %me.kind,
                    exit = ?status.ok().and_then(|s| s.code()),
                    "backend_exited_unexpectedly"
                );
                remove_pid(&me.pid_file);
                state.phase = Phase::Stopped;
                state.current_pid = None;
                state.start_time = None;

                let config = state.config.clone();
                match config {
                    Some(config) if config.restart_on_failure => {
                        let cap = config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS);
                        if state.failure_restarts < cap {
                            state.failure_restarts += 1;
                            Some(config)
                        } else {
                            tracing::error!(
                                target: "supervisor",
                                backend = %me.kind,
                                cap,
                                "failure_restart_cap_reached"
                            );
                            None
                        }
                    }
                    _ => None,
                }
            };

            if let Some(config) = restart_config {
                sleep(RESTART_PAUSE).await;
                let outcome = me.start(config).await;
                if outcome.success {
                    let mut state = me.state.lock().await;
                    state.restart_count += 1;
                }
            }
        });
    }
}
