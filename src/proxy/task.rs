use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::backend::wire::{TaskCounters, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<TaskCounters>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// `task_<ms_epoch>_<rand36>`: the random suffix is nine base36 digits
/// drawn from a v4 uuid.
pub fn generate_task_id() -> String {
    let mut seed = uuid::Uuid::new_v4().as_u128();
    let mut suffix = [0_u8; 9];
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    for slot in suffix.iter_mut() {
        *slot = DIGITS[(seed % 36) as usize];
        seed /= 36;
    }
    format!(
        "task_{}_{}",
        now_ms(),
        std::str::from_utf8(&suffix).expect("base36 digits are ascii")
    )
}

/// Owns every task record for its lifetime; everything else refers to
/// tasks by id. Terminal transitions are exactly-once.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending task before any backend I/O happens.
    pub fn create(&self, model: &str, device_id: Option<&str>) -> Task {
        let now = now_ms();
        let task = Task {
            id: generate_task_id(),
            model: model.to_string(),
            device_id: device_id.map(str::to_string),
            state: TaskState::Pending,
            counters: None,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.insert(task.id.clone(), task.clone());
        task
    }

    pub fn mark_running(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.get_mut(task_id) {
            Some(task) if task.state == TaskState::Pending => {
                task.state = TaskState::Running;
                task.updated_at = now_ms();
                true
            }
            _ => false,
        }
    }

    /// Move a task to a terminal state. Returns false (and changes
    /// nothing) when the task is unknown or already terminal.
    pub fn finish(
        &self,
        task_id: &str,
        state: TaskState,
        counters: Option<TaskCounters>,
    ) -> bool {
        debug_assert!(state.is_terminal());
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.get_mut(task_id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = state;
                task.counters = counters;
                task.updated_at = now_ms();
                true
            }
            _ => false,
        }
    }

    pub fn update_model(&self, task_id: &str, model: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(task) = inner.get_mut(task_id) {
            task.model = model.to_string();
            task.updated_at = now_ms();
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.get(task_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal records older than the given age; keeps the map from
    /// growing without bound on long-lived nodes.
    pub fn prune(&self, max_age_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(max_age_ms);
        let mut inner = self.inner.lock().expect("lock poisoned");
        let before = inner.len();
        inner.retain(|_, task| !task.state.is_terminal() || task.updated_at >= cutoff);
        before - inner.len()
    }
}
