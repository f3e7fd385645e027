use std::{net::UdpSocket, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::supervisor::metrics::MetricsSampler;
use crate::tunnel::message::{DeviceInfo, HeartbeatReport, Payload};
use crate::tunnel::router::{GATEWAY_PEER, SendPolicy, TunnelRouter};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Best-effort local address discovery: route a UDP socket and read the
/// chosen source address. No packet is sent.
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn device_info() -> DeviceInfo {
    DeviceInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: sysinfo::System::host_name(),
        total_memory_bytes: {
            let mut system = sysinfo::System::new();
            system.refresh_memory();
            system.total_memory()
        },
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

/// Periodic telemetry toward the gateway. Never propagates errors; a
/// saturated tunnel just skips a beat.
pub async fn run_heartbeat(
    router: Arc<TunnelRouter>,
    sampler: Arc<MetricsSampler>,
    resolver: Arc<crate::models::ModelResolver>,
    registry: Arc<crate::registry::BackendRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let info = device_info();
    let ip = local_ip();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let usage = sampler.system_usage();
                let backend = registry.current_backend();
                let model = resolver.default_model(backend).await;
                let report = HeartbeatReport {
                    device_id: router.device_id().to_string(),
                    cpu_usage_percent: usage.cpu_percent,
                    memory_usage_percent: usage.memory_percent,
                    // No GPU probe wired in; reported as zero until one is.
                    gpu_usage_percent: 0.0,
                    ip: ip.clone(),
                    model: Some(model),
                    device_info: info.clone(),
                };
                match router
                    .send(GATEWAY_PEER, Payload::DeviceHeartbeatReport(report), SendPolicy::Timeout)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(target: "tunnel.heartbeat", "heartbeat_sent");
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "tunnel.heartbeat",
                            error = %err,
                            "heartbeat_skipped"
                        );
                    }
                }
            }
        }
    }
}
