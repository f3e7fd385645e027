use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::backend::InferenceAdapter;
use crate::backend::kind::BackendKind;
use crate::backend::wire::ModelEntry;

const CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedModels {
    at: Instant,
    models: Vec<ModelEntry>,
}

struct CachedDefault {
    at: Instant,
    model: String,
}

/// Per-backend model inventory and default-model caches (5 minute TTL).
/// Constructed before the registry and injected wherever the effective
/// model must be resolved; adapters never call back into it.
pub struct ModelResolver {
    adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>>,
    models: Mutex<HashMap<BackendKind, CachedModels>>,
    defaults: Mutex<HashMap<BackendKind, CachedDefault>>,
}

impl ModelResolver {
    pub fn new(adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>>) -> Self {
        Self {
            adapters,
            models: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        }
    }

    pub async fn models(&self, backend: BackendKind) -> Vec<ModelEntry> {
        {
            let cache = self.models.lock().await;
            if let Some(entry) = cache.get(&backend) {
                if entry.at.elapsed() < CACHE_TTL {
                    return entry.models.clone();
                }
            }
        }

        let listed = match self.adapters.get(&backend) {
            Some(adapter) => adapter.list_models().await,
            None => Vec::new(),
        };

        // An empty inventory is not cached: the backend may just be booting.
        if !listed.is_empty() {
            let mut cache = self.models.lock().await;
            cache.insert(
                backend,
                CachedModels {
                    at: Instant::now(),
                    models: listed.clone(),
                },
            );
        }
        listed
    }

    /// First inventory entry, falling back to the backend-specific default
    /// when the inventory is empty or unreachable.
    pub async fn default_model(&self, backend: BackendKind) -> String {
        {
            let cache = self.defaults.lock().await;
            if let Some(entry) = cache.get(&backend) {
                if entry.at.elapsed() < CACHE_TTL {
                    return entry.model.clone();
                }
            }
        }

        let listed = self.models(backend).await;
        let model = listed
            .first()
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| backend.fallback_model().to_string());

        let mut cache = self.defaults.lock().await;
        cache.insert(
            backend,
            CachedDefault {
                at: Instant::now(),
                model: model.clone(),
            },
        );
        model
    }

    /// Resolve the model actually sent to the backend. Never fails: the
    /// worst case passes the requested name through and lets the backend
    /// report its own error.
    pub async fn effective_model(&self, backend: BackendKind, requested: Option<&str>) -> String {
        let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
            return self.default_model(backend).await;
        };

        let listed = self.models(backend).await;
        if listed.is_empty() {
            // Inventory probe failed; pass through untouched.
            return requested.to_string();
        }

        let wanted = ModelEntry::normalized(requested);
        if listed
            .iter()
            .any(|entry| ModelEntry::normalized(&entry.name) == wanted)
        {
            return requested.to_string();
        }

        let fallback = self.default_model(backend).await;
        tracing::warn!(
            target: "models",
            backend = %backend,
            requested,
            substituted = %fallback,
            "requested_model_not_in_inventory"
        );
        fallback
    }

    /// Drop both caches for one backend and reload the inventory.
    pub async fn refresh(&self, backend: BackendKind) -> Vec<ModelEntry> {
        {
            let mut models = self.models.lock().await;
            models.remove(&backend);
        }
        {
            let mut defaults = self.defaults.lock().await;
            defaults.remove(&backend);
        }
        self.models(backend).await
    }
}
