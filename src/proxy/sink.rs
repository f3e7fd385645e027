use bytes::Bytes;
use tokio::sync::mpsc;

/// Status and headers written before the first payload byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkFrame {
    Head(ResponseHead),
    Chunk(Bytes),
    End,
}

/// The sink was dropped by its consumer (caller disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Caller-facing output stream: a bounded frame channel. Backpressure is
/// the channel capacity; consumer abort surfaces as a failed send, which
/// the proxy treats as cancellation.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkFrame>,
}

impl SinkHandle {
    pub fn channel(capacity: usize) -> (SinkHandle, mpsc::Receiver<SinkFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (SinkHandle { tx }, rx)
    }

    pub async fn send_head(&self, head: ResponseHead) -> Result<(), SinkClosed> {
        self.tx
            .send(SinkFrame::Head(head))
            .await
            .map_err(|_| SinkClosed)
    }

    pub async fn send_chunk(&self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx
            .send(SinkFrame::Chunk(chunk))
            .await
            .map_err(|_| SinkClosed)
    }

    pub async fn end(&self) -> Result<(), SinkClosed> {
        self.tx.send(SinkFrame::End).await.map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer goes away; used in `select!` copy loops.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
