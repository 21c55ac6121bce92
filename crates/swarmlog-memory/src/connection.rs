//! Duplex in-process connections.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use swarmlog_api::{Connection, SwarmError};

/// One end of an in-process duplex connection.
///
/// Frames are delivered in order and never fragmented. Closing either end
/// closes the whole connection, like dropping a socket.
pub struct MemoryConnection {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Create a connected pair of ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let a = Self {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed: closed.clone(),
        };
        let b = Self {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed,
        };
        (a, b)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Bytes) -> Result<(), SwarmError> {
        if self.closed.is_cancelled() {
            return Err(SwarmError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| SwarmError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Option<Bytes>, SwarmError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (a, b) = MemoryConnection::pair();
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"ping"));
        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn close_is_visible_on_both_ends() {
        let (a, b) = MemoryConnection::pair();
        a.close().await;
        b.closed().await;
        assert!(matches!(a.send(Bytes::new()).await, Err(SwarmError::ConnectionClosed)));
        assert_eq!(b.recv().await.unwrap(), None);
    }
}
