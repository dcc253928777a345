//! Peer streams: the raw duplex connection handed over by the transport, and
//! the registry-owned handle the relay writes through.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::identity::PeerId;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lines queued for one peer's writer task.
pub type Outbox = mpsc::Receiver<String>;

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An established, handshaken duplex byte channel to one peer.
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub direction: Direction,
    /// Chosen by the dialer during the handshake; both ends hold the same value.
    pub session: Uuid,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl PeerConnection {
    pub fn new<R, W>(
        peer_id: PeerId,
        direction: Direction,
        session: Uuid,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer_id,
            direction,
            session,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Handle to a live stream, held by the registry.
///
/// Writes go through a bounded outbox drained by that stream's own writer
/// task, so queuing a line never waits on the network. Closing flips the
/// liveness flag, which the stream's pumps watch and exit on; the socket
/// halves they own are dropped with them.
#[derive(Debug)]
pub struct PeerStream {
    peer_id: PeerId,
    direction: Direction,
    session: Uuid,
    outbox: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
}

impl PeerStream {
    /// New live handle plus the receiving end of its outbox.
    pub fn new(
        peer_id: PeerId,
        direction: Direction,
        session: Uuid,
        capacity: usize,
    ) -> (Arc<Self>, Outbox) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let stream = Arc::new(Self {
            peer_id,
            direction,
            session,
            outbox,
            closed,
        });
        (stream, rx)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Queue one line (without terminator) for this peer.
    pub fn send_line(&self, line: String) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.outbox.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Stalled,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the stream dead and wake its pumps. Returns whether it was alive.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("stream closed")]
    Closed,
    #[error("peer is not keeping up; outbox full")]
    Stalled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> PeerId {
        crate::identity::Keypair::generate().peer_id()
    }

    #[tokio::test]
    async fn queued_lines_reach_outbox_in_order() {
        let (stream, mut outbox) = PeerStream::new(peer(), Direction::Outbound, Uuid::new_v4(), 4);
        stream.send_line("one".into()).unwrap();
        stream.send_line("two".into()).unwrap();
        assert_eq!(outbox.recv().await.as_deref(), Some("one"));
        assert_eq!(outbox.recv().await.as_deref(), Some("two"));
    }

    #[test]
    fn full_outbox_reports_stalled() {
        let (stream, _outbox) = PeerStream::new(peer(), Direction::Inbound, Uuid::new_v4(), 1);
        stream.send_line("a".into()).unwrap();
        assert_eq!(stream.send_line("b".into()), Err(SendError::Stalled));
    }

    #[test]
    fn closed_stream_rejects_sends() {
        let (stream, _outbox) = PeerStream::new(peer(), Direction::Inbound, Uuid::new_v4(), 4);
        assert!(stream.close());
        assert!(!stream.close());
        assert!(!stream.is_alive());
        assert_eq!(stream.send_line("x".into()), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let (stream, _outbox) = PeerStream::new(peer(), Direction::Inbound, Uuid::new_v4(), 4);
        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.closed().await })
        };
        stream.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();
    }
}
