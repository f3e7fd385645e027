use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::backend::build_default_adapters;
use crate::backend::error::BackendError;
use crate::backend::kind::BackendKind;
use crate::config::{ConfigStore, NodeConfig};
use crate::models::ModelResolver;
use crate::proxy::{StreamingProxy, TaskStore, usage_channel};
use crate::registry::{BackendRegistry, SwitchOptions, SwitchOutcome};
use crate::server;
use crate::supervisor::{
    ProcessSupervisor, StartOptions, SupervisorStatus, metrics::MetricsSampler,
};
use crate::tunnel::{
    self, heartbeat, registration::DeviceRegistration, registration::default_registration_path,
    registration::load_registration, router::TunnelRouter,
};

/// The owned context everything hangs off: no globals, explicit handles.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<ConfigStore>,
    pub registry: Arc<BackendRegistry>,
    pub resolver: Arc<ModelResolver>,
    pub proxy: Arc<StreamingProxy>,
    pub tasks: Arc<TaskStore>,
    pub sampler: Arc<MetricsSampler>,
    pub supervisors: HashMap<BackendKind, Arc<ProcessSupervisor>>,
    pub registration: Option<DeviceRegistration>,
}

impl Node {
    pub fn build(store: ConfigStore, config: NodeConfig) -> (Arc<Node>, tokio::task::JoinHandle<()>) {
        let store = Arc::new(store);
        let adapters =
            build_default_adapters(&config.ollama_url, &config.vllm_url, config.http.clone());
        let resolver = Arc::new(ModelResolver::new(adapters.clone()));
        let registry = Arc::new(BackendRegistry::new(
            adapters,
            config.env_default_backend,
            store.clone(),
        ));

        let registration = default_registration_path().and_then(|path| {
            match load_registration(&path) {
                Ok(registration) => Some(registration),
                Err(err) => {
                    tracing::debug!(
                        target: "node",
                        error = %format!("{err:#}"),
                        "device_registration_not_loaded"
                    );
                    None
                }
            }
        });
        let device_id = registration.as_ref().map(|r| r.device_id.clone());

        let tasks = Arc::new(TaskStore::new());
        let (usage_tx, usage_handle) = usage_channel(256);
        let proxy = Arc::new(StreamingProxy::new(
            tasks.clone(),
            resolver.clone(),
            usage_tx,
            device_id,
        ));

        let sampler = Arc::new(MetricsSampler::new());
        let mut supervisors = HashMap::new();
        supervisors.insert(
            BackendKind::Native,
            ProcessSupervisor::new(BackendKind::Native, &config.ollama_url, sampler.clone()),
        );
        supervisors.insert(
            BackendKind::OpenAiCompat,
            ProcessSupervisor::new(BackendKind::OpenAiCompat, &config.vllm_url, sampler.clone()),
        );

        (
            Arc::new(Node {
                config,
                store,
                registry,
                resolver,
                proxy,
                tasks,
                sampler,
                supervisors,
                registration,
            }),
            usage_handle,
        )
    }

    /// Switch with supervisor assistance: optionally boot the target
    /// backend first, then flip the registry (which persists the choice
    /// and schedules the self-restart).
    pub async fn switch_backend(
        &self,
        target: BackendKind,
        opts: SwitchOptions,
        start_if_stopped: bool,
    ) -> Result<SwitchOutcome, BackendError> {
        if start_if_stopped {
            let report = self.registry.detect_backends(true).await;
            if !report.available.contains(&target) {
                if let Some(supervisor) = self.supervisors.get(&target) {
                    let outcome = supervisor.start(self.start_options_for(target)).await;
                    if !outcome.success {
                        tracing::warn!(
                            target: "node",
                            backend = %target,
                            message = %outcome.message,
                            "backend_start_before_switch_failed"
                        );
                    }
                }
            }
        }
        self.registry.switch_backend(target, opts).await
    }

    pub fn start_options_for(&self, target: BackendKind) -> StartOptions {
        match target {
            BackendKind::Native => StartOptions {
                restart_on_failure: self.config.resource.restart_on_failure,
                max_restarts: self.config.resource.max_restarts,
                ..StartOptions::default()
            },
            BackendKind::OpenAiCompat => self.config.vllm_start.clone(),
        }
    }

    pub async fn supervisor_statuses(&self) -> Vec<SupervisorStatus> {
        let mut statuses = Vec::with_capacity(self.supervisors.len());
        for supervisor in self.supervisors.values() {
            statuses.push(supervisor.status().await);
        }
        statuses
    }
}

enum ExitReason {
    Signal(&'static str),
    SelfRestart,
}

/// Run the node until a signal or a post-switch self-restart. Exit code
/// is 0 on every orderly path; an external supervisor relaunches the
/// process with the persisted config.
pub async fn run(store: ConfigStore, config: NodeConfig) -> Result<()> {
    let port = config.port;
    let gateway = config.gateway.clone();
    let (node, _usage_handle) = Node::build(store, config);

    let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);
    node.registry.set_restart_handle(restart_tx);

    let shutdown = CancellationToken::new();

    // Tunnel client + heartbeat, when a gateway is configured.
    if let Some(endpoint) = gateway.tunnel_endpoint.clone() {
        let device_id = node
            .registration
            .as_ref()
            .map(|r| r.device_id.clone())
            .unwrap_or_else(|| "unregistered-node".to_string());
        let (router, outbound_rx) = TunnelRouter::new(
            device_id,
            node.registry.clone(),
            node.resolver.clone(),
            node.proxy.clone(),
            256,
        );

        tokio::spawn(tunnel::run_tunnel(
            router.clone(),
            outbound_rx,
            endpoint,
            node.registration.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(heartbeat::run_heartbeat(
            router,
            node.sampler.clone(),
            node.resolver.clone(),
            node.registry.clone(),
            std::time::Duration::from_secs(gateway.heartbeat_interval_secs.max(1)),
            shutdown.clone(),
        ));
    } else {
        tracing::info!(target: "node", "no_gateway_configured_tunnel_disabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind HTTP port {port}"))?;
    tracing::info!(target: "node", port, "http_ingress_listening");

    let app = server::build_router(node.clone());
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    let mut sigint = signal(SignalKind::interrupt()).context("unable to listen for SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    let exit_reason = tokio::select! {
        _ = sigint.recv() => ExitReason::Signal("SIGINT"),
        _ = sigterm.recv() => ExitReason::Signal("SIGTERM"),
        _ = restart_rx.recv() => ExitReason::SelfRestart,
    };

    shutdown.cancel();
    let _ = server_task.await;

    match exit_reason {
        ExitReason::Signal(name) => {
            tracing::info!(target: "node", signal = name, "node_stopped");
        }
        ExitReason::SelfRestart => {
            tracing::info!(
                target: "node",
                "node_exiting_for_backend_switch_relaunch"
            );
        }
    }

    Ok(())
}
