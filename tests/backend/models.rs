use std::{collections::HashMap, sync::Arc, sync::atomic::Ordering};

use narval::backend::InferenceAdapter;
use narval::backend::kind::BackendKind;
use narval::models::ModelResolver;

use crate::support::StubAdapter;

fn resolver_with(models: &[&str]) -> (ModelResolver, Arc<StubAdapter>) {
    let stub = Arc::new(StubAdapter::new(BackendKind::Native, true, models));
    let mut adapters: HashMap<BackendKind, Arc<dyn InferenceAdapter>> = HashMap::new();
    adapters.insert(BackendKind::Native, stub.clone());
    (ModelResolver::new(adapters), stub)
}

#[tokio::test]
async fn given_inventory_when_resolving_default_then_first_entry_wins() {
    let (resolver, _) = resolver_with(&["qwen2.5:7b", "llama3.2:latest"]);
    assert_eq!(
        resolver.default_model(BackendKind::Native).await,
        "qwen2.5:7b"
    );
}

#[tokio::test]
async fn given_empty_inventory_when_resolving_default_then_backend_fallback_is_used() {
    let (resolver, _) = resolver_with(&[]);
    assert_eq!(
        resolver.default_model(BackendKind::Native).await,
        "llama3.2:latest"
    );
}

#[tokio::test]
async fn given_empty_request_when_resolving_effective_model_then_default_is_substituted() {
    let (resolver, _) = resolver_with(&["qwen2.5:7b"]);
    assert_eq!(
        resolver.effective_model(BackendKind::Native, None).await,
        "qwen2.5:7b"
    );
    assert_eq!(
        resolver.effective_model(BackendKind::Native, Some("  ")).await,
        "qwen2.5:7b"
    );
}

#[tokio::test]
async fn given_listed_model_when_resolving_then_original_spelling_is_passed_through() {
    let (resolver, _) = resolver_with(&["Qwen2.5:7B"]);
    // Lookup is case-insensitive; the wire string is the caller's.
    assert_eq!(
        resolver
            .effective_model(BackendKind::Native, Some("qwen2.5:7b"))
            .await,
        "qwen2.5:7b"
    );
}

#[tokio::test]
async fn given_unlisted_model_when_resolving_then_default_is_substituted() {
    let (resolver, _) = resolver_with(&["qwen2.5:7b"]);
    assert_eq!(
        resolver
            .effective_model(BackendKind::Native, Some("no-such-model"))
            .await,
        "qwen2.5:7b"
    );
}

#[tokio::test]
async fn given_unreachable_inventory_when_resolving_then_request_passes_through() {
    let (resolver, _) = resolver_with(&[]);
    // Empty inventory means the probe could not confirm anything; the
    // requested name must not be blocked.
    assert_eq!(
        resolver
            .effective_model(BackendKind::Native, Some("anything"))
            .await,
        "anything"
    );
}

#[tokio::test]
async fn given_cached_inventory_when_listing_again_then_adapter_is_not_re_queried() {
    let (resolver, stub) = resolver_with(&["qwen2.5:7b"]);
    resolver.models(BackendKind::Native).await;
    resolver.models(BackendKind::Native).await;
    assert_eq!(stub.list_calls.load(Ordering::SeqCst), 1);

    resolver.refresh(BackendKind::Native).await;
    assert_eq!(stub.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn given_listed_models_when_fetching_info_then_every_name_resolves() {
    let (resolver, stub) = resolver_with(&["a-model", "b-model"]);
    for entry in resolver.models(BackendKind::Native).await {
        stub.model_info(&entry.name)
            .await
            .expect("every listed model must resolve");
    }
}
