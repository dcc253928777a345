//! LAN discovery: UDP multicast beacon, parse beacons/responses, report peers to the connector.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanchat_core::wire::{decode_frame, encode_frame};
use lanchat_core::{Message, PeerId, PROTOCOL_VERSION};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// A peer seen on the network: its ID and where to dial it.
pub type Found = (PeerId, SocketAddr);

struct PeerState {
    addr: SocketAddr,
    last_seen: Instant,
}

/// What this node announces.
#[derive(Debug, Clone)]
pub struct Announce {
    pub peer_id: PeerId,
    pub namespace: String,
    pub listen_addr: SocketAddr,
}

impl Announce {
    fn beacon(&self) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            namespace: self.namespace.clone(),
            peer_id: self.peer_id,
            listen_addr: self.listen_addr,
        }
    }

    fn response(&self) -> Message {
        Message::DiscoveryResponse {
            protocol_version: PROTOCOL_VERSION,
            namespace: self.namespace.clone(),
            peer_id: self.peer_id,
            listen_addr: self.listen_addr,
        }
    }

    /// Accept a received beacon or response if it is someone else in our
    /// namespace speaking our version. Returns the peer, its dial address, and
    /// whether it was a beacon (which deserves a response).
    fn accept(&self, msg: &Message, from: SocketAddr) -> Option<(PeerId, SocketAddr, bool)> {
        let (version, namespace, peer_id, listen_addr, is_beacon) = match msg {
            Message::Beacon {
                protocol_version,
                namespace,
                peer_id,
                listen_addr,
            } => (protocol_version, namespace, peer_id, listen_addr, true),
            Message::DiscoveryResponse {
                protocol_version,
                namespace,
                peer_id,
                listen_addr,
            } => (protocol_version, namespace, peer_id, listen_addr, false),
            _ => return None,
        };
        if *version != PROTOCOL_VERSION || *namespace != self.namespace || *peer_id == self.peer_id {
            return None;
        }
        let ip = listen_addr.ip();
        // A wildcard listen address means "wherever my datagrams come from".
        let addr = if ip.is_unspecified() {
            SocketAddr::new(from.ip(), listen_addr.port())
        } else if ip.is_loopback() && !is_local(from.ip()) {
            debug!(peer = %peer_id.short(), %from, "peer listens on loopback of another host");
            return None;
        } else {
            *listen_addr
        };
        Some((*peer_id, addr, is_beacon))
    }
}

/// Whether `ip` belongs to this host: only a local address can be bound.
fn is_local(ip: IpAddr) -> bool {
    ip.is_loopback() || std::net::UdpSocket::bind((ip, 0)).is_ok()
}

/// Run discovery: send periodic beacons, answer and parse beacons/responses,
/// and push every sighting to `found_tx`. Repeat sightings are sent again;
/// the receiver decides whether to act.
///
/// Returns when any of its loops ends: on a socket error, or once `found_tx`
/// has no receiver.
pub async fn run_discovery(
    announce: Announce,
    discovery_port: u16,
    found_tx: mpsc::UnboundedSender<Found>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let peers: Arc<Mutex<HashMap<PeerId, PeerState>>> = Arc::new(Mutex::new(HashMap::new()));
    let announce = Arc::new(announce);

    tokio::select! {
        r = beacon_loop(socket.clone(), announce.clone(), discovery_port) => r,
        r = recv_loop(socket, peers.clone(), announce, found_tx, discovery_port) => r,
        r = peer_timeout_loop(peers) => r,
    }
}

/// Nodes on one host share the discovery port, so the socket is bound with
/// address and port reuse.
fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, discovery_port)).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    announce: Arc<Announce>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let frame = encode_frame(&announce.beacon())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<PeerId, PeerState>>>,
    announce: Arc<Announce>,
    found_tx: mpsc::UnboundedSender<Found>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let response_frame = encode_frame(&announce.response())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    // Unicast to a shared port reaches only one of the sockets bound to it,
    // so responses go to the group as well.
    let group = SocketAddr::from((MULTICAST_GROUP, discovery_port));

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((msg, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        let Some((peer_id, addr, is_beacon)) = announce.accept(&msg, from) else {
            continue;
        };
        let is_new = {
            let mut p = peers.lock().await;
            p.insert(
                peer_id,
                PeerState {
                    addr,
                    last_seen: Instant::now(),
                },
            )
            .is_none()
        };
        if is_new {
            info!(peer = %peer_id.short(), %addr, "found peer");
        }
        if found_tx.send((peer_id, addr)).is_err() {
            return Ok(());
        }
        if is_beacon {
            if let Err(e) = socket.send_to(&response_frame, group).await {
                debug!(error = %e, "response send failed");
            }
        }
    }
}

async fn peer_timeout_loop(peers: Arc<Mutex<HashMap<PeerId, PeerState>>>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let mut p = peers.lock().await;
        p.retain(|id, s| {
            let alive = now.duration_since(s.last_seen) < PEER_TIMEOUT;
            if !alive {
                info!(peer = %id.short(), addr = %s.addr, "peer no longer announcing");
            }
            alive
        });
    }
}
