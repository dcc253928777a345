//! Relay engine: local input to every peer, each peer's messages to local
//! output and (in fan-out mode) on to every other peer.
//!
//! Per stream the relay runs two tasks: an inbound pump reading lines off the
//! socket and a writer draining that stream's outbox. Broadcasting only queues
//! into outboxes, so one stalled peer never holds up delivery to the rest; a
//! peer whose outbox fills, or whose write times out, is dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::ChatLine;
use crate::registry::PeerRegistry;
use crate::stream::{BoxedReader, BoxedWriter, Outbox, PeerConnection, PeerStream};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 4096;

/// Whether messages from one peer are re-sent to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Group chat: forward every received message to all other peers.
    #[default]
    FanOut,
    /// Print only; never forward.
    PointToPoint,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mode: RelayMode,
    pub outbox_capacity: usize,
    pub write_timeout: Duration,
    pub max_line_len: usize,
    pub seen_cache_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
        }
    }
}

/// A message for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Author of the message.
    pub from: PeerId,
    /// Peer whose stream it arrived on; differs from `from` when relayed.
    pub via: PeerId,
    pub text: String,
}

/// Bounded set of recently seen message IDs, oldest evicted first.
#[derive(Debug)]
struct SeenCache {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if `id` was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Line decoder for local input. An over-long line is logged and skipped;
/// `FramedRead` would otherwise end the stream after the decode error.
struct LocalLines {
    codec: LinesCodec,
    max_len: usize,
}

impl LocalLines {
    fn new(max_len: usize) -> Self {
        Self {
            codec: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }

    fn skip_long(
        &mut self,
        buf: &mut BytesMut,
        decode: fn(&mut LinesCodec, &mut BytesMut) -> Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<String>, LinesCodecError> {
        loop {
            match decode(&mut self.codec, buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max = self.max_len, "local line too long; discarded");
                }
                other => return other,
            }
        }
    }
}

impl Decoder for LocalLines {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        self.skip_long(buf, LinesCodec::decode)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        self.skip_long(buf, LinesCodec::decode_eof)
    }
}

struct Inner {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    config: RelayConfig,
    output: mpsc::UnboundedSender<Delivery>,
    seen: Mutex<SeenCache>,
}

/// Cheap to clone; all clones share one registry and seen cache.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    /// New relay over `registry`, speaking as the registry's local peer.
    /// The receiver yields messages for the local user.
    pub fn new(
        registry: Arc<PeerRegistry>,
        config: RelayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let local_id = registry.local_id();
        let (output, rx) = mpsc::unbounded_channel();
        let seen = Mutex::new(SeenCache::new(config.seen_cache_size));
        let relay = Self {
            inner: Arc::new(Inner {
                local_id,
                registry,
                config,
                output,
                seen,
            }),
        };
        (relay, rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.registry
    }

    /// Register a freshly handshaken connection and start its pumps.
    ///
    /// If the registry keeps an existing stream to the same peer instead, the
    /// connection is dropped and the returned stream is already closed.
    pub async fn attach(&self, conn: PeerConnection) -> Arc<PeerStream> {
        let PeerConnection {
            peer_id,
            direction,
            session,
            reader,
            writer,
        } = conn;
        let (stream, outbox) =
            PeerStream::new(peer_id, direction, session, self.inner.config.outbox_capacity);
        if !self.inner.registry.register_preferred(stream.clone()).await {
            debug!(peer = %peer_id.short(), ?direction, "dropping duplicate connection");
            return stream;
        }
        info!(peer = %peer_id.short(), ?direction, "peer connected");

        tokio::spawn(self.clone().run_writer(stream.clone(), writer, outbox));
        tokio::spawn(self.clone().run_inbound(stream.clone(), reader));
        stream
    }

    /// Send text typed locally to every connected peer. Returns how many
    /// peers it was queued for.
    pub async fn send_local(&self, text: impl Into<String>) -> usize {
        let line = ChatLine::new(self.inner.local_id, text);
        self.inner.seen.lock().await.insert(line.id);
        self.broadcast(&line, &[]).await
    }

    /// Queue `line` for every registered peer not in `exclude`.
    ///
    /// A peer that cannot take the line is unregistered; the others are
    /// unaffected and no error is returned for the broadcast as a whole.
    pub async fn broadcast(&self, line: &ChatLine, exclude: &[PeerId]) -> usize {
        let encoded = line.encode();
        let mut queued = 0;
        for stream in self.inner.registry.snapshot().await {
            let peer_id = stream.peer_id();
            if exclude.contains(&peer_id) {
                continue;
            }
            match stream.send_line(encoded.clone()) {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(peer = %peer_id.short(), error = %e, "dropping peer");
                    self.inner.registry.unregister_stream(&stream).await;
                }
            }
        }
        debug!(id = %line.id.simple(), queued, "broadcast");
        queued
    }

    /// Outbound pump: every line read from `input` goes to all peers. Lines
    /// over `max_line_len` are dropped and reading carries on.
    ///
    /// Returns when input ends or fails; inbound relaying carries on.
    pub async fn run_outbound<R: AsyncRead + Unpin>(&self, input: R) {
        let mut lines = FramedRead::new(input, LocalLines::new(self.inner.config.max_line_len));
        while let Some(next) = lines.next().await {
            match next {
                Ok(text) => {
                    let n = self.send_local(text).await;
                    if n == 0 {
                        debug!("no peers connected; message not sent");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "local input failed");
                    break;
                }
            }
        }
        info!("local input closed; still relaying inbound messages");
    }

    async fn run_inbound(self, stream: Arc<PeerStream>, reader: BoxedReader) {
        let peer_id = stream.peer_id();
        let codec = LinesCodec::new_with_max_length(self.inner.config.max_line_len);
        let mut lines = FramedRead::new(reader, codec);
        loop {
            let next = tokio::select! {
                _ = stream.closed() => break,
                next = lines.next() => next,
            };
            match next {
                Some(Ok(raw)) => match ChatLine::parse(&raw) {
                    Ok(line) => self.on_line(peer_id, line).await,
                    Err(e) => {
                        warn!(peer = %peer_id.short(), error = %e, "protocol error");
                        break;
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = %peer_id.short(), "line too long");
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(peer = %peer_id.short(), error = %e, "read failed");
                    break;
                }
                None => {
                    info!(peer = %peer_id.short(), "peer closed stream");
                    break;
                }
            }
        }
        self.inner.registry.unregister_stream(&stream).await;
    }

    async fn on_line(&self, via: PeerId, line: ChatLine) {
        if line.origin == self.inner.local_id {
            debug!(id = %line.id.simple(), "dropping echo of own message");
            return;
        }
        if !self.inner.seen.lock().await.insert(line.id) {
            debug!(id = %line.id.simple(), "dropping duplicate");
            return;
        }
        let _ = self.inner.output.send(Delivery {
            from: line.origin,
            via,
            text: line.text.clone(),
        });
        if self.inner.config.mode == RelayMode::FanOut {
            self.broadcast(&line, &[via, line.origin]).await;
        }
    }

    async fn run_writer(self, stream: Arc<PeerStream>, writer: BoxedWriter, mut outbox: Outbox) {
        let peer_id = stream.peer_id();
        let mut sink = FramedWrite::new(writer, LinesCodec::new());
        loop {
            let line = tokio::select! {
                _ = stream.closed() => break,
                line = outbox.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            match tokio::time::timeout(self.inner.config.write_timeout, sink.send(line)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(peer = %peer_id.short(), error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    warn!(peer = %peer_id.short(), "write timed out");
                    break;
                }
            }
        }
        self.inner.registry.unregister_stream(&stream).await;
    }
}

/// Spawn the outbound pump on its own task.
pub fn spawn_outbound<R>(relay: Relay, input: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move { relay.run_outbound(input).await })
}
