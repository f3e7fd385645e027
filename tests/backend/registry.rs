use std::{collections::HashMap, sync::Arc};

use narval::backend::InferenceAdapter;
use narval::backend::error::BackendErrorKind;
use narval::backend::kind::BackendKind;
use narval::config::ConfigStore;
use narval::registry::{BackendRegistry, SwitchOptions};
use uuid::Uuid;

use crate::support::StubAdapter;

fn temp_store() -> Arc<ConfigStore> {
    let path = std::env::temp_dir()
        .join(format!("narval-registry-test-{}", Uuid::now_v7()))
        .join("config.json");
    Arc::new(ConfigStore::load_or_default(&path).expect("temp store loads"))
}

fn registry_with(
    native_up: bool,
    openai_up: bool,
    store: Arc<ConfigStore>,
) -> (BackendRegistry, Arc<StubAdapter>, Arc<StubAdapter>) {
    let native = Arc::new(StubAdapter::new(BackendKind::Native, native_up, &["llama3.2:latest"]));
    let openai = Arc::new(StubAdapter::new(BackendKind::OpenAiCompat, openai_up, &["qwen2"]));
    let mut adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>> = HashMap::new();
    adapters.insert(BackendKind::Native, native.clone());
    adapters.insert(BackendKind::OpenAiCompat, openai.clone());
    (
        BackendRegistry::new(adapters, None, store),
        native,
        openai,
    )
}

#[tokio::test]
async fn given_no_override_and_no_env_when_selecting_then_native_is_current() {
    let (registry, _, _) = registry_with(true, true, temp_store());
    assert_eq!(registry.current_backend(), BackendKind::Native);
}

#[tokio::test]
async fn given_env_default_when_selecting_then_env_wins_over_hardcoded_preference() {
    let native = Arc::new(StubAdapter::new(BackendKind::Native, true, &[]));
    let openai = Arc::new(StubAdapter::new(BackendKind::OpenAiCompat, true, &[]));
    let mut adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>> = HashMap::new();
    adapters.insert(BackendKind::Native, native);
    adapters.insert(BackendKind::OpenAiCompat, openai);
    let registry = BackendRegistry::new(adapters, Some(BackendKind::OpenAiCompat), temp_store());
    assert_eq!(registry.current_backend(), BackendKind::OpenAiCompat);
}

#[tokio::test]
async fn given_both_backends_up_when_detecting_then_native_priority_wins() {
    let (registry, _, _) = registry_with(true, true, temp_store());
    let report = registry.detect_backends(false).await;
    assert_eq!(report.available.len(), 2);
    assert_eq!(report.recommended, Some(BackendKind::Native));
}

#[tokio::test]
async fn given_native_down_when_detecting_then_openai_is_recommended() {
    let (registry, _, _) = registry_with(false, true, temp_store());
    let report = registry.detect_backends(false).await;
    assert_eq!(report.available, vec![BackendKind::OpenAiCompat]);
    assert_eq!(report.unavailable, vec![BackendKind::Native]);
    assert_eq!(report.recommended, Some(BackendKind::OpenAiCompat));
    assert!(!report.details[&BackendKind::Native].is_available);
}

#[tokio::test]
async fn given_fresh_detection_when_detecting_again_then_cache_short_circuits_probes() {
    let (registry, native, openai) = registry_with(true, true, temp_store());

    let first = registry.detect_backends(false).await;
    let second = registry.detect_backends(false).await;
    assert_eq!(first.recommended, second.recommended);
    assert_eq!(native.health_probes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(openai.health_probes.load(std::sync::atomic::Ordering::SeqCst), 1);

    registry.detect_backends(true).await;
    assert_eq!(native.health_probes.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn given_switch_when_persisting_then_client_type_lands_in_the_store() {
    let store = temp_store();
    let (registry, _, _) = registry_with(true, true, store.clone());

    let outcome = registry
        .switch_backend(
            BackendKind::OpenAiCompat,
            SwitchOptions {
                validate_availability: false,
                force: false,
                defer_restart: true,
            },
        )
        .await
        .expect("switch should succeed");

    assert_eq!(outcome.backend, BackendKind::OpenAiCompat);
    assert!(!outcome.restart_scheduled);
    assert_eq!(registry.current_backend(), BackendKind::OpenAiCompat);
    assert_eq!(store.client_type(), Some(BackendKind::OpenAiCompat));
}

#[tokio::test]
async fn given_unavailable_target_when_validating_switch_then_it_is_refused_unless_forced() {
    let (registry, _, _) = registry_with(true, false, temp_store());

    let err = registry
        .switch_backend(
            BackendKind::OpenAiCompat,
            SwitchOptions {
                validate_availability: true,
                force: false,
                defer_restart: true,
            },
        )
        .await
        .expect_err("unavailable target must be refused");
    assert_eq!(err.kind, BackendErrorKind::Unavailable);

    registry
        .switch_backend(
            BackendKind::OpenAiCompat,
            SwitchOptions {
                validate_availability: true,
                force: true,
                defer_restart: true,
            },
        )
        .await
        .expect("force overrides availability validation");
}

#[tokio::test]
async fn given_persisted_client_type_when_rebuilding_then_override_is_restored() {
    let store = temp_store();
    store
        .set_client_type(Some(BackendKind::OpenAiCompat))
        .unwrap();
    let (registry, _, _) = registry_with(true, true, store);
    assert_eq!(registry.current_backend(), BackendKind::OpenAiCompat);
}
