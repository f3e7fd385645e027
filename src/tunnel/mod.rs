pub mod heartbeat;
pub mod message;
pub mod registration;
pub mod router;

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use message::{Envelope, encode_envelope};
use registration::DeviceRegistration;
use router::TunnelRouter;

pub use router::{SendPolicy, TunnelError, TunnelErrorKind};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connect to the local peer-to-peer transport process and pump envelopes
/// both ways until shutdown. The transport binary itself is spawned and
/// owned elsewhere; this side only speaks NDJSON over its local endpoint.
///
/// One read loop and one serialized writer per connection; a lost
/// connection cancels every in-flight stream and reconnects after a
/// fixed delay.
pub async fn run_tunnel(
    router: Arc<TunnelRouter>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    endpoint: String,
    registration: Option<DeviceRegistration>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = TcpStream::connect(&endpoint) => match connected {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(
                        target: "tunnel",
                        endpoint = %endpoint,
                        error = %err,
                        "transport_connect_failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            }
        };

        tracing::info!(target: "tunnel", endpoint = %endpoint, "transport_connected");
        let (read_half, mut write_half) = stream.into_split();

        if let Some(registration) = &registration {
            if let Err(err) = router.register(registration).await {
                tracing::warn!(target: "tunnel", error = %err, "device_register_send_failed");
            }
            if let Err(err) = router.report_models().await {
                tracing::warn!(target: "tunnel", error = %err, "model_report_send_failed");
            }
        }

        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    router.cancel_all();
                    return;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => router.handle_line(&line).await,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(target: "tunnel", error = %err, "transport_read_failed");
                        break;
                    }
                },
                envelope = outbound_rx.recv() => {
                    let Some(envelope) = envelope else {
                        // Every sender is gone; the tunnel has nothing
                        // left to do.
                        return;
                    };
                    let encoded = match encode_envelope(&envelope) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            tracing::error!(
                                target: "tunnel",
                                error = %err,
                                "envelope_encoding_failed"
                            );
                            continue;
                        }
                    };
                    if let Err(err) = write_half.write_all(encoded.as_bytes()).await {
                        tracing::warn!(target: "tunnel", error = %err, "transport_write_failed");
                        break;
                    }
                    if let Err(err) = write_half.flush().await {
                        tracing::warn!(target: "tunnel", error = %err, "transport_flush_failed");
                        break;
                    }
                }
            }
        }

        // Peer side went away mid-run: tear down every active stream so
        // no further chunks are emitted for their task ids.
        router.cancel_all();
        tracing::info!(target: "tunnel", "transport_disconnected");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
