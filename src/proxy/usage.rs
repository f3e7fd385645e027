use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Local,
    Tunnel,
}

/// Emitted once per terminal task state for downstream accounting.
/// Pricing is not modeled here; consumers only see the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub completed: bool,
    pub source: UsageSource,
}

/// Non-blocking emitter: accounting must never stall the dataplane, so a
/// full channel drops the event with a warning.
#[derive(Clone)]
pub struct UsageSender {
    tx: mpsc::Sender<UsageEvent>,
}

impl UsageSender {
    pub fn emit(&self, event: UsageEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(
                target: "proxy.usage",
                error = %err,
                "usage_event_dropped"
            );
        }
    }
}

/// Build the emitter plus its consumer loop. The loop logs each event and
/// never propagates errors.
pub fn usage_channel(capacity: usize) -> (UsageSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<UsageEvent>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::info!(
                target: "proxy.usage",
                task_id = %event.task_id,
                device_id = event.device_id.as_deref().unwrap_or(""),
                model = %event.model,
                prompt_tokens = event.prompt_tokens,
                completion_tokens = event.completion_tokens,
                completed = event.completed,
                source = ?event.source,
                "usage_recorded"
            );
        }
    });
    (UsageSender { tx }, handle)
}
