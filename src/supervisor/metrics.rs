use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Shared sysinfo sampler. One `System` behind a mutex: refreshes are
/// cheap for single-pid lookups and the heartbeat only fires every 30 s.
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// RSS bytes and CPU % for one process, when it exists.
    pub fn sample_process(&self, pid: u32) -> Option<ProcessMetrics> {
        let mut system = self.system.lock().expect("lock poisoned");
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|process| ProcessMetrics {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }

    /// Whole-host usage for heartbeat telemetry.
    pub fn system_usage(&self) -> SystemUsage {
        let mut system = self.system.lock().expect("lock poisoned");
        system.refresh_memory();
        system.refresh_cpu_usage();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        SystemUsage {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }
}
