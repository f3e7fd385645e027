use std::sync::Arc;

use narval::backend::kind::BackendKind;
use narval::supervisor::{
    ProcessSupervisor, StartOptions, metrics::MetricsSampler, pid_alive,
    pidfile::{pid_file_path, read_pid, write_pid},
};

// The native and openai-compat PID files are fixed per backend, so each
// test below sticks to one backend kind to stay isolated.

#[tokio::test]
async fn given_reclaimed_child_when_stopping_then_sigterm_lands_and_pid_file_is_removed() {
    let child = std::process::Command::new("sleep")
        .arg("300")
        .spawn()
        .expect("sleep must spawn");
    let pid = child.id();

    let pid_file = pid_file_path(BackendKind::Native);
    write_pid(&pid_file, pid).expect("pid file written");

    // The constructor reclaims the live process from the PID file.
    let supervisor = ProcessSupervisor::new(
        BackendKind::Native,
        "http://127.0.0.1:9",
        Arc::new(MetricsSampler::new()),
    );
    let status = supervisor.status().await;
    assert!(status.is_running);
    assert_eq!(status.pid, Some(pid));

    let outcome = supervisor.stop().await;
    assert!(outcome.success);
    assert!(!pid_file.exists(), "stop removes the PID file");

    // SIGTERM is enough for sleep; no SIGKILL window needed.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!pid_alive(pid));

    let after = supervisor.status().await;
    assert!(!after.is_running);
    assert_eq!(after.pid, None);
}

#[tokio::test]
async fn given_dead_pid_and_failed_spawn_then_bookkeeping_reconciles_and_start_reports_failure() {
    // A PID that existed once but is long gone.
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("true must spawn");
    let pid = child.id();
    let _ = child.wait();

    let pid_file = pid_file_path(BackendKind::OpenAiCompat);
    write_pid(&pid_file, pid).expect("pid file written");

    // Stale PID files are cleared at construction, restoring the
    // `pid file exists <=> currently running` invariant.
    let supervisor = ProcessSupervisor::new(
        BackendKind::OpenAiCompat,
        "http://127.0.0.1:9",
        Arc::new(MetricsSampler::new()),
    );
    assert_eq!(read_pid(&pid_file), None);

    let status = supervisor.status().await;
    assert!(!status.is_running);
    assert_eq!(status.pid, None);

    // A binary that cannot spawn surfaces as a startup failure, not a
    // hang in the readiness probe.
    let outcome = supervisor
        .start(StartOptions {
            binary: Some("/nonexistent/narval-test-binary".to_string()),
            ..StartOptions::default()
        })
        .await;
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
    assert!(!pid_file.exists());
}
