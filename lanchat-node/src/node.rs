//! Node wiring: transport, discovery, connector, relay pumps and terminal I/O.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use lanchat_core::arbiter::{self, Role};
use lanchat_core::{Delivery, Keypair, PeerId, PeerRegistry, Relay};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{self, Announce, Found};
use crate::transport::{LocalHello, Transport};

/// What the connector did with one discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// This node has the smaller ID; a dial was started.
    Dialing,
    /// The remote has the smaller ID and will dial us.
    Waiting,
    /// A stream to the peer is already registered.
    AlreadyConnected,
    /// A dial to the peer is already in flight.
    InFlight,
}

/// Turns discovery events into outbound connections, applying the arbiter.
#[derive(Clone)]
pub struct Connector {
    transport: Arc<Transport>,
    relay: Relay,
    pending: Arc<Mutex<HashSet<PeerId>>>,
}

impl Connector {
    pub fn new(transport: Arc<Transport>, relay: Relay) -> Self {
        Self {
            transport,
            relay,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Handle one sighting. Never waits on the network: the dial runs on its
    /// own task, and a failed dial is logged and forgotten.
    pub async fn on_peer_found(&self, peer_id: PeerId, addr: SocketAddr) -> ConnectOutcome {
        if arbiter::role(&self.relay.local_id(), &peer_id) == Role::Wait {
            debug!(peer = %peer_id.short(), "peer has the smaller ID; waiting for it to dial");
            return ConnectOutcome::Waiting;
        }
        if self.relay.registry().contains(&peer_id).await {
            return ConnectOutcome::AlreadyConnected;
        }
        if !self.pending.lock().await.insert(peer_id) {
            return ConnectOutcome::InFlight;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match this.transport.connect(Some(peer_id), addr).await {
                Ok(conn) => {
                    this.relay.attach(conn).await;
                }
                Err(e) => warn!(peer = %peer_id.short(), %addr, error = %e, "connect failed"),
            }
            this.pending.lock().await.remove(&peer_id);
        });
        ConnectOutcome::Dialing
    }

    /// Consume discovery events until the sender side goes away.
    pub async fn run(self, mut found_rx: mpsc::UnboundedReceiver<Found>) {
        while let Some((peer_id, addr)) = found_rx.recv().await {
            self.on_peer_found(peer_id, addr).await;
        }
    }
}

/// A started node: listening, with its relay ready but no pumps running yet.
pub struct Node {
    config: Config,
    transport: Arc<Transport>,
    relay: Relay,
    output: mpsc::UnboundedReceiver<Delivery>,
}

impl Node {
    /// Generate an identity and bind the transport. Bind failure is fatal.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let keypair = Keypair::generate();
        let hello = LocalHello::new(&keypair, config.protocol_id.clone());
        let listen = config.listen_addr();
        let transport = Transport::listen(listen, hello, config.connect_timeout())
            .await
            .with_context(|| format!("failed to listen on {listen}"))?;
        let registry = Arc::new(PeerRegistry::new(keypair.peer_id()));
        let (relay, output) = Relay::new(registry, config.relay_config());
        Ok(Self {
            config,
            transport: Arc::new(transport),
            relay,
            output,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.relay.local_id()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Run until `shutdown` resolves, then close every peer stream.
    pub async fn run<F>(self, bootstrap: Option<SocketAddr>, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        let Node {
            config,
            transport,
            relay,
            mut output,
        } = self;
        let local_addr = transport.local_addr()?;

        let accept_task = tokio::spawn(transport.clone().run_accept(relay.clone()));

        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let connector = Connector::new(transport.clone(), relay.clone());
        let connector_task = tokio::spawn(connector.run(found_rx));

        let discovery_task = if config.discovery {
            let announce = Announce {
                peer_id: relay.local_id(),
                namespace: config.discovery_namespace.clone(),
                listen_addr: local_addr,
            };
            let port = config.discovery_port;
            Some(tokio::spawn(async move {
                if let Err(e) = discovery::run_discovery(announce, port, found_tx).await {
                    warn!(error = %e, "discovery stopped; use --peer-address to connect directly");
                }
            }))
        } else {
            drop(found_tx);
            None
        };

        if let Some(addr) = bootstrap {
            let transport = transport.clone();
            let relay = relay.clone();
            tokio::spawn(async move {
                match transport.connect(None, addr).await {
                    Ok(conn) => {
                        println!("Connected to {} at {}", conn.peer_id, addr);
                        relay.attach(conn).await;
                    }
                    Err(e) => warn!(%addr, error = %e, "bootstrap connect failed"),
                }
            });
        }

        let printer_task = tokio::spawn(async move {
            while let Some(d) = output.recv().await {
                println!("From {}\n> {}", d.from, d.text);
            }
        });
        let outbound_task = lanchat_core::relay::spawn_outbound(relay.clone(), tokio::io::stdin());

        let result = shutdown.await;

        let closed = relay.registry().close_all().await;
        info!(closed, "shutting down");
        accept_task.abort();
        connector_task.abort();
        outbound_task.abort();
        printer_task.abort();
        if let Some(t) = discovery_task {
            t.abort();
        }
        result
    }
}
