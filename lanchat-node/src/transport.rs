//! Local transport: TCP server (incoming), TCP client (outbound to peers), Hello handshake.
//! Handshaken connections are handed to the relay; chat traffic is not framed here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::wire::{read_frame, write_frame};
use lanchat_core::{
    Direction, FrameError, Keypair, Message, PeerConnection, PeerId, PublicKey, Relay,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("timed out")]
    Timeout,
    #[error("protocol mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: String, theirs: String },
    #[error("peer ID does not match its public key")]
    KeyMismatch,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("expected peer {expected}, got {got}")]
    UnexpectedPeer { expected: PeerId, got: PeerId },
    #[error("expected Hello")]
    UnexpectedMessage,
    #[error("acceptor answered for a different session")]
    SessionMismatch,
}

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: PeerId,
    pub session: Uuid,
}

/// What this node says in its Hello, and what it expects back.
#[derive(Debug, Clone)]
pub struct LocalHello {
    pub protocol_id: String,
    pub peer_id: PeerId,
    pub public_key: PublicKey,
}

impl LocalHello {
    pub fn new(keypair: &Keypair, protocol_id: impl Into<String>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            peer_id: keypair.peer_id(),
            public_key: keypair.public_key().clone(),
        }
    }

    fn message(&self, session: Uuid) -> Message {
        Message::Hello {
            protocol_id: self.protocol_id.clone(),
            peer_id: self.peer_id,
            public_key: self.public_key.clone(),
            session,
        }
    }

    /// Check the remote Hello.
    fn verify(&self, msg: Message, expected: Option<PeerId>) -> Result<Handshake, HandshakeError> {
        let Message::Hello {
            protocol_id,
            peer_id,
            public_key,
            session,
        } = msg
        else {
            return Err(HandshakeError::UnexpectedMessage);
        };
        if protocol_id != self.protocol_id {
            return Err(HandshakeError::ProtocolMismatch {
                ours: self.protocol_id.clone(),
                theirs: protocol_id,
            });
        }
        if PeerId::from_public_key(public_key.as_bytes()) != peer_id {
            return Err(HandshakeError::KeyMismatch);
        }
        if peer_id == self.peer_id {
            return Err(HandshakeError::SelfConnection);
        }
        if let Some(expected) = expected {
            if expected != peer_id {
                return Err(HandshakeError::UnexpectedPeer {
                    expected,
                    got: peer_id,
                });
            }
        }
        Ok(Handshake { peer_id, session })
    }
}

/// Acceptor side: read the dialer's Hello, then answer with its session.
pub async fn handshake_accept<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &LocalHello,
) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let theirs = read_frame(reader).await?;
    let hs = local.verify(theirs, None)?;
    write_frame(writer, &local.message(hs.session)).await?;
    Ok(hs)
}

/// Dialer side: send our Hello with a fresh session first, then read the answer.
pub async fn handshake_connect<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &LocalHello,
    expected: Option<PeerId>,
) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let session = Uuid::new_v4();
    write_frame(writer, &local.message(session)).await?;
    let theirs = read_frame(reader).await?;
    let hs = local.verify(theirs, expected)?;
    if hs.session != session {
        return Err(HandshakeError::SessionMismatch);
    }
    Ok(hs)
}

/// Listening TCP endpoint plus the parameters for outbound dials.
pub struct Transport {
    listener: TcpListener,
    hello: LocalHello,
    timeout: Duration,
}

impl Transport {
    /// Bind the listener. Failure here is fatal for the node.
    pub async fn listen(
        addr: SocketAddr,
        hello: LocalHello,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hello,
            timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept incoming connections forever, attaching each to `relay` after
    /// its handshake. A failed handshake only drops that connection.
    pub async fn run_accept(self: Arc<Self>, relay: Relay) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let transport = self.clone();
                    let relay = relay.clone();
                    tokio::spawn(async move {
                        match transport.accept(stream).await {
                            Ok(conn) => {
                                relay.attach(conn).await;
                            }
                            Err(e) => warn!(%addr, error = %e, "inbound handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<PeerConnection, HandshakeError> {
        let _ = stream.set_nodelay(true);
        let (mut r, mut w) = stream.into_split();
        let hs = tokio::time::timeout(
            self.timeout,
            handshake_accept(&mut r, &mut w, &self.hello),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        debug!(
            peer = %hs.peer_id.short(),
            session = %hs.session.simple(),
            "inbound handshake complete"
        );
        Ok(PeerConnection::new(hs.peer_id, Direction::Inbound, hs.session, r, w))
    }

    /// Dial `addr` and handshake. With `expected`, the remote must prove to be that peer.
    pub async fn connect(
        &self,
        expected: Option<PeerId>,
        addr: SocketAddr,
    ) -> Result<PeerConnection, HandshakeError> {
        let dial = async {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            let (mut r, mut w) = stream.into_split();
            let hs = handshake_connect(&mut r, &mut w, &self.hello, expected).await?;
            Ok::<_, HandshakeError>(PeerConnection::new(
                hs.peer_id,
                Direction::Outbound,
                hs.session,
                r,
                w,
            ))
        };
        let conn = tokio::time::timeout(self.timeout, dial)
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        info!(peer = %conn.peer_id.short(), %addr, "connected");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanchat_core::{PeerRegistry, RelayConfig, DEFAULT_PROTOCOL_ID};

    fn hello(protocol: &str) -> (Keypair, LocalHello) {
        let kp = Keypair::generate();
        let h = LocalHello::new(&kp, protocol);
        (kp, h)
    }

    async fn run_pair(
        dialer: LocalHello,
        acceptor: LocalHello,
        expected: Option<PeerId>,
    ) -> (
        Result<Handshake, HandshakeError>,
        Result<Handshake, HandshakeError>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);
        tokio::join!(
            async move { handshake_connect(&mut ar, &mut aw, &dialer, expected).await },
            async move { handshake_accept(&mut br, &mut bw, &acceptor).await },
        )
    }

    #[tokio::test]
    async fn handshake_exchanges_ids() {
        let (a, ha) = hello(DEFAULT_PROTOCOL_ID);
        let (b, hb) = hello(DEFAULT_PROTOCOL_ID);
        let (dialed, accepted) = run_pair(ha, hb, Some(b.peer_id())).await;
        let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());
        assert_eq!(dialed.peer_id, b.peer_id());
        assert_eq!(accepted.peer_id, a.peer_id());
        assert_eq!(dialed.session, accepted.session);
    }

    #[tokio::test]
    async fn wrong_session_echo_rejected() {
        let (_, ha) = hello(DEFAULT_PROTOCOL_ID);
        let (_, hb) = hello(DEFAULT_PROTOCOL_ID);
        let (a, b) = tokio::io::duplex(4096);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);
        let (dialed, _) = tokio::join!(
            async move { handshake_connect(&mut ar, &mut aw, &ha, None).await },
            async move {
                read_frame(&mut br).await.unwrap();
                write_frame(&mut bw, &hb.message(Uuid::new_v4())).await.unwrap();
            },
        );
        assert!(matches!(dialed, Err(HandshakeError::SessionMismatch)));
    }

    #[tokio::test]
    async fn protocol_mismatch_rejected() {
        let (_, ha) = hello("/chat/1.0.0");
        let (_, hb) = hello("/chat/2.0.0");
        let (dialed, accepted) = run_pair(ha, hb, None).await;
        assert!(matches!(accepted, Err(HandshakeError::ProtocolMismatch { .. })));
        // The acceptor hangs up without answering.
        assert!(dialed.is_err());
    }

    #[tokio::test]
    async fn wrong_peer_rejected_by_dialer() {
        let (_, ha) = hello(DEFAULT_PROTOCOL_ID);
        let (_, hb) = hello(DEFAULT_PROTOCOL_ID);
        let someone_else = Keypair::generate().peer_id();
        let (dialed, _) = run_pair(ha, hb, Some(someone_else)).await;
        assert!(matches!(dialed, Err(HandshakeError::UnexpectedPeer { .. })));
    }

    #[tokio::test]
    async fn self_connection_rejected() {
        let (_, h) = hello(DEFAULT_PROTOCOL_ID);
        let (_, accepted) = run_pair(h.clone(), h, None).await;
        assert!(matches!(accepted, Err(HandshakeError::SelfConnection)));
    }

    #[tokio::test]
    async fn forged_id_rejected() {
        let (_, mut ha) = hello(DEFAULT_PROTOCOL_ID);
        let (_, hb) = hello(DEFAULT_PROTOCOL_ID);
        ha.peer_id = Keypair::generate().peer_id();
        let (_, accepted) = run_pair(ha, hb, None).await;
        assert!(matches!(accepted, Err(HandshakeError::KeyMismatch)));
    }

    #[tokio::test]
    async fn tcp_connect_attaches_both_sides() {
        let (a, ha) = hello(DEFAULT_PROTOCOL_ID);
        let (b, hb) = hello(DEFAULT_PROTOCOL_ID);
        let timeout = Duration::from_secs(2);
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ta = Transport::listen(loopback, ha, timeout).await.unwrap();
        let tb = Arc::new(Transport::listen(loopback, hb, timeout).await.unwrap());
        let b_addr = tb.local_addr().unwrap();

        let (relay_a, _out_a) =
            Relay::new(Arc::new(PeerRegistry::new(a.peer_id())), RelayConfig::default());
        let (relay_b, mut out_b) =
            Relay::new(Arc::new(PeerRegistry::new(b.peer_id())), RelayConfig::default());
        tokio::spawn(tb.clone().run_accept(relay_b.clone()));

        let conn = ta.connect(Some(b.peer_id()), b_addr).await.unwrap();
        assert_eq!(conn.peer_id, b.peer_id());
        relay_a.attach(conn).await;

        tokio::time::timeout(timeout, async {
            while !relay_b.registry().contains(&a.peer_id()).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("acceptor never registered the dialer");

        assert_eq!(relay_a.send_local("over tcp").await, 1);
        let d = tokio::time::timeout(timeout, out_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.from, a.peer_id());
        assert_eq!(d.text, "over tcp");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let (_, ha) = hello(DEFAULT_PROTOCOL_ID);
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ta = Transport::listen(loopback, ha, Duration::from_secs(1))
            .await
            .unwrap();
        // Grab a free port, then close it.
        let free = TcpListener::bind(loopback).await.unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);
        assert!(ta.connect(None, addr).await.is_err());
    }
}
