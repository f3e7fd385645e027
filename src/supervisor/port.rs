use tokio::net::TcpListener;

/// Bind a throwaway listener to test whether a port is free.
pub async fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Scan upward from `start` for the first free port. Bounded so a fully
/// occupied range fails instead of spinning.
pub async fn next_available_port(start: u16) -> Option<u16> {
    let end = start.saturating_add(100);
    for port in start..=end {
        if port_available(port).await {
            return Some(port);
        }
    }
    None
}
