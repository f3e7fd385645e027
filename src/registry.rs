use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::InferenceAdapter;
use crate::backend::error::{BackendError, BackendErrorKind, unavailable};
use crate::backend::kind::BackendKind;
use crate::backend::wire::{HealthStatus, now_ms};
use crate::config::ConfigStore;

const DETECTION_TTL: Duration = Duration::from_secs(30);
const SELF_RESTART_GRACE: Duration = Duration::from_secs(1);

pub const NATIVE_PRIORITY: u32 = 10;
pub const OPENAI_COMPAT_PRIORITY: u32 = 20;

#[derive(Clone)]
pub struct Registration {
    pub adapter: Arc<dyn InferenceAdapter>,
    /// Lower wins.
    pub priority: u32,
    pub enabled: bool,
    pub registered_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub available: Vec<BackendKind>,
    pub unavailable: Vec<BackendKind>,
    pub details: HashMap<BackendKind, HealthStatus>,
    pub recommended: Option<BackendKind>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchOptions {
    pub validate_availability: bool,
    pub force: bool,
    /// Skip scheduling the self-restart (tests, batched switches).
    pub defer_restart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub backend: BackendKind,
    pub restart_scheduled: bool,
}

struct RegistryState {
    registrations: HashMap<BackendKind, Registration>,
    override_kind: Option<BackendKind>,
    detection: Option<(Instant, DetectionReport)>,
}

/// Owns adapter registrations and the current-backend selection. The map
/// mutex is held only for map reads/writes; probing and persistence happen
/// outside of it.
pub struct BackendRegistry {
    state: Mutex<RegistryState>,
    env_default: Option<BackendKind>,
    store: Arc<ConfigStore>,
    restart_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl BackendRegistry {
    pub fn new(
        adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>>,
        env_default: Option<BackendKind>,
        store: Arc<ConfigStore>,
    ) -> Self {
        let mut registrations = HashMap::new();
        for (kind, adapter) in adapters {
            let priority = match kind {
                BackendKind::Native => NATIVE_PRIORITY,
                BackendKind::OpenAiCompat => OPENAI_COMPAT_PRIORITY,
            };
            registrations.insert(
                kind,
                Registration {
                    adapter,
                    priority,
                    enabled: true,
                    registered_at: now_ms(),
                },
            );
        }

        let persisted = store.client_type();
        Self {
            state: Mutex::new(RegistryState {
                registrations,
                override_kind: persisted,
                detection: None,
            }),
            env_default,
            store,
            restart_tx: Mutex::new(None),
        }
    }

    /// Hook the node's restart channel in; without it a switch only
    /// persists and flips the override.
    pub fn set_restart_handle(&self, tx: mpsc::Sender<()>) {
        *self.restart_tx.lock().expect("lock poisoned") = Some(tx);
    }

    /// Replace or add a registration (external adapters allowed).
    pub fn register(&self, kind: BackendKind, adapter: Arc<dyn InferenceAdapter>, priority: u32) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.registrations.insert(
            kind,
            Registration {
                adapter,
                priority,
                enabled: true,
                registered_at: now_ms(),
            },
        );
        state.detection = None;
    }

    pub fn set_enabled(&self, kind: BackendKind, enabled: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(registration) = state.registrations.get_mut(&kind) {
            registration.enabled = enabled;
        }
        state.detection = None;
    }

    /// Selection order: runtime override, env default, Native. Never none.
    pub fn current_backend(&self) -> BackendKind {
        let state = self.state.lock().expect("lock poisoned");
        state
            .override_kind
            .or(self.env_default)
            .unwrap_or(BackendKind::Native)
    }

    pub fn adapter(&self, kind: BackendKind) -> Option<Arc<dyn InferenceAdapter>> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .registrations
            .get(&kind)
            .filter(|r| r.enabled)
            .map(|r| r.adapter.clone())
    }

    pub fn current_adapter(&self) -> Arc<dyn InferenceAdapter> {
        let current = self.current_backend();
        self.adapter(current)
            .or_else(|| self.adapter(BackendKind::Native))
            .expect("built-in registrations always exist")
    }

    /// Probe every enabled adapter concurrently. Results are cached for
    /// 30 s with last-writer-wins semantics; `force` bypasses the cache.
    pub async fn detect_backends(&self, force: bool) -> DetectionReport {
        if !force {
            let state = self.state.lock().expect("lock poisoned");
            if let Some((at, report)) = &state.detection {
                if at.elapsed() < DETECTION_TTL {
                    return report.clone();
                }
            }
        }

        let probes: Vec<(BackendKind, u32, Arc<dyn InferenceAdapter>)> = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .registrations
                .iter()
                .filter(|(_, r)| r.enabled)
                .map(|(kind, r)| (*kind, r.priority, r.adapter.clone()))
                .collect()
        };

        let results = join_all(probes.iter().map(|(kind, priority, adapter)| {
            let kind = *kind;
            let priority = *priority;
            let adapter = adapter.clone();
            async move { (kind, priority, adapter.health().await) }
        }))
        .await;

        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        let mut details = HashMap::new();
        let mut best: Option<(u32, BackendKind)> = None;
        for (kind, priority, health) in results {
            if health.is_available {
                available.push(kind);
                if best.map(|(p, _)| priority < p).unwrap_or(true) {
                    best = Some((priority, kind));
                }
            } else {
                unavailable.push(kind);
            }
            details.insert(kind, health);
        }

        let recommended = best.map(|(_, kind)| kind).or_else(|| available.first().copied());
        let report = DetectionReport {
            available,
            unavailable,
            details,
            recommended,
        };

        tracing::debug!(
            target: "registry",
            available = ?report.available,
            recommended = ?report.recommended,
            "backend_detection_complete"
        );

        let mut state = self.state.lock().expect("lock poisoned");
        state.detection = Some((Instant::now(), report.clone()));
        report
    }

    /// Health of one backend, served from the detection cache.
    pub async fn health(&self, kind: BackendKind, force: bool) -> Option<HealthStatus> {
        let report = self.detect_backends(force).await;
        report.details.get(&kind).cloned()
    }

    /// Switch the current backend. Persists `clientType` and, unless
    /// deferred, schedules the sanctioned self-restart (exit 0 after a
    /// 1 s grace); in-flight requests finish against the old adapter.
    pub async fn switch_backend(
        &self,
        target: BackendKind,
        opts: SwitchOptions,
    ) -> Result<SwitchOutcome, BackendError> {
        {
            let state = self.state.lock().expect("lock poisoned");
            let registered = state
                .registrations
                .get(&target)
                .map(|r| r.enabled)
                .unwrap_or(false);
            if !registered {
                return Err(BackendError::new(
                    BackendErrorKind::Validation,
                    format!("backend '{target}' is not registered"),
                )
                .with_retryable(false));
            }
        }

        if opts.validate_availability && !opts.force {
            let report = self.detect_backends(true).await;
            if !report.available.contains(&target) {
                return Err(unavailable(format!(
                    "backend '{target}' is not currently available"
                ))
                .with_backend(target));
            }
        }

        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.override_kind = Some(target);
        }

        self.store.set_client_type(Some(target)).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Internal,
                format!("failed to persist backend choice: {err}"),
            )
            .with_retryable(false)
        })?;

        let restart_tx = self.restart_tx.lock().expect("lock poisoned").clone();
        let restart_scheduled = !opts.defer_restart && restart_tx.is_some();
        if let Some(tx) = restart_tx {
            if restart_scheduled {
                tokio::spawn(async move {
                    tokio::time::sleep(SELF_RESTART_GRACE).await;
                    let _ = tx.send(()).await;
                });
            }
        }

        tracing::info!(
            target: "registry",
            backend = %target,
            restart_scheduled,
            "backend_switched"
        );

        Ok(SwitchOutcome {
            backend: target,
            restart_scheduled,
        })
    }
}
