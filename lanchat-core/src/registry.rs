//! Peer registry: the set of live streams, one per peer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::arbiter::preferred_direction;
use crate::identity::PeerId;
use crate::stream::PeerStream;

/// Live streams keyed by peer. Every read and write of the map goes through
/// this type; callers iterate [`snapshot`](Self::snapshot) copies only.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: PeerId,
    entries: Mutex<HashMap<PeerId, Arc<PeerStream>>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Insert or replace the stream for its peer. A replaced stream is closed.
    pub async fn register(&self, stream: Arc<PeerStream>) {
        let previous = self.entries.lock().await.insert(stream.peer_id(), stream.clone());
        Self::retire(previous, &stream);
    }

    /// Register `stream` unless the peer already has a live stream that
    /// outranks it. Returns false, with `stream` closed, if it was refused.
    ///
    /// The two ends of a pair must settle on the same survivor whatever order
    /// they see duplicate streams in. The stream opened by the side the arbiter
    /// picks as dialer wins, then the smaller session.
    pub async fn register_preferred(&self, stream: Arc<PeerStream>) -> bool {
        let peer_id = stream.peer_id();
        let mut entries = self.entries.lock().await;
        if let Some(current) = entries.get(&peer_id) {
            if Arc::ptr_eq(current, &stream) {
                return true;
            }
            if current.is_alive() && self.rank(current) < self.rank(&stream) {
                drop(entries);
                stream.close();
                info!(
                    peer = %peer_id.short(),
                    session = %stream.session().simple(),
                    "kept existing stream; refused duplicate"
                );
                return false;
            }
        }
        let previous = entries.insert(peer_id, stream.clone());
        drop(entries);
        Self::retire(previous, &stream);
        true
    }

    fn retire(previous: Option<Arc<PeerStream>>, stream: &Arc<PeerStream>) {
        let peer_id = stream.peer_id();
        match previous {
            Some(old) if !Arc::ptr_eq(&old, stream) => {
                old.close();
                info!(
                    peer = %peer_id.short(),
                    session = %old.session().simple(),
                    "replaced existing stream"
                );
            }
            _ => debug!(peer = %peer_id.short(), "registered stream"),
        }
    }

    /// Lower ranks win. Identical on both ends of a connection.
    fn rank(&self, stream: &PeerStream) -> (bool, Uuid) {
        let preferred = preferred_direction(&self.local_id, &stream.peer_id());
        (stream.direction() != preferred, stream.session())
    }

    /// Remove and close the peer's stream. Removing an absent peer is a no-op.
    pub async fn unregister(&self, peer_id: &PeerId) -> bool {
        let removed = self.entries.lock().await.remove(peer_id);
        match removed {
            Some(stream) => {
                stream.close();
                info!(peer = %peer_id.short(), "unregistered stream");
                true
            }
            None => false,
        }
    }

    /// Close `stream`, and remove it only if it is still the registered one.
    ///
    /// Pumps tear down through this so a stream that was already replaced
    /// cannot evict its replacement.
    pub async fn unregister_stream(&self, stream: &Arc<PeerStream>) -> bool {
        stream.close();
        let peer_id = stream.peer_id();
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(&peer_id)
            .is_some_and(|s| Arc::ptr_eq(s, stream));
        if current {
            entries.remove(&peer_id);
            info!(peer = %peer_id.short(), "unregistered stream");
        }
        current
    }

    /// Copy of the live streams, ordered by peer ID.
    pub async fn snapshot(&self) -> Vec<Arc<PeerStream>> {
        let mut streams: Vec<Arc<PeerStream>> =
            self.entries.lock().await.values().cloned().collect();
        streams.sort_by_key(|s| s.peer_id());
        streams
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.lock().await.contains_key(peer_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Remove and close everything. Used on shutdown. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<PeerStream>> =
            self.entries.lock().await.drain().map(|(_, s)| s).collect();
        for stream in &drained {
            stream.close();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::stream::Direction;

    fn id(last: u8) -> PeerId {
        let mut b = [0u8; 16];
        b[15] = last;
        PeerId::from_bytes(b)
    }

    fn session(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn stream(peer_id: PeerId, direction: Direction, session: Uuid) -> Arc<PeerStream> {
        PeerStream::new(peer_id, direction, session, 8).0
    }

    fn stream_for(peer_id: PeerId) -> Arc<PeerStream> {
        stream(peer_id, Direction::Inbound, Uuid::new_v4())
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Keypair::generate().peer_id())
    }

    #[tokio::test]
    async fn register_replaces_and_closes_old() {
        let reg = registry();
        let peer = Keypair::generate().peer_id();
        let old = stream_for(peer);
        let new = stream_for(peer);
        reg.register(old.clone()).await;
        reg.register(new.clone()).await;

        assert!(!old.is_alive());
        assert!(new.is_alive());
        assert_eq!(reg.len().await, 1);
        assert!(Arc::ptr_eq(&reg.snapshot().await[0], &new));
    }

    #[tokio::test]
    async fn preferred_stream_replaces_and_closes_old() {
        // Local 5 dials 9, so its outbound stream is the keeper.
        let reg = PeerRegistry::new(id(5));
        let old = stream(id(9), Direction::Inbound, session(1));
        let new = stream(id(9), Direction::Outbound, session(2));
        assert!(reg.register_preferred(old.clone()).await);
        assert!(reg.register_preferred(new.clone()).await);

        assert!(!old.is_alive());
        assert!(new.is_alive());
        assert_eq!(reg.len().await, 1);
        let snap = reg.snapshot().await;
        assert!(Arc::ptr_eq(&snap[0], &new));
    }

    #[tokio::test]
    async fn duplicate_losing_the_tie_break_is_refused() {
        let reg = PeerRegistry::new(id(5));
        let keeper = stream(id(9), Direction::Outbound, session(7));
        let duplicate = stream(id(9), Direction::Inbound, session(1));
        assert!(reg.register_preferred(keeper.clone()).await);
        assert!(!reg.register_preferred(duplicate.clone()).await);

        assert!(keeper.is_alive());
        assert!(!duplicate.is_alive());
        assert!(Arc::ptr_eq(&reg.snapshot().await[0], &keeper));
    }

    #[tokio::test]
    async fn same_direction_falls_back_to_smaller_session() {
        let reg = PeerRegistry::new(id(5));
        let high = stream(id(9), Direction::Outbound, session(9));
        let low = stream(id(9), Direction::Outbound, session(3));
        assert!(reg.register_preferred(high.clone()).await);
        assert!(reg.register_preferred(low.clone()).await);
        assert!(!high.is_alive());
        assert!(!reg.register_preferred(high).await);
        assert!(low.is_alive());
    }

    #[tokio::test]
    async fn crossed_registration_keeps_the_same_stream_on_both_ends() {
        // Two connections between 5 and 9: s1 dialed by 9, s2 dialed by 5.
        // Each end sees them in the opposite order.
        let small = PeerRegistry::new(id(5));
        let large = PeerRegistry::new(id(9));

        let s1_at_small = stream(id(9), Direction::Inbound, session(1));
        let s2_at_small = stream(id(9), Direction::Outbound, session(2));
        small.register_preferred(s1_at_small.clone()).await;
        small.register_preferred(s2_at_small.clone()).await;

        let s2_at_large = stream(id(5), Direction::Inbound, session(2));
        let s1_at_large = stream(id(5), Direction::Outbound, session(1));
        large.register_preferred(s2_at_large.clone()).await;
        large.register_preferred(s1_at_large.clone()).await;

        assert!(s2_at_small.is_alive() && s2_at_large.is_alive());
        assert!(!s1_at_small.is_alive() && !s1_at_large.is_alive());
        assert_eq!(small.snapshot().await[0].session(), session(2));
        assert_eq!(large.snapshot().await[0].session(), session(2));
    }

    #[tokio::test]
    async fn dead_entry_is_always_replaced() {
        let reg = PeerRegistry::new(id(5));
        let keeper = stream(id(9), Direction::Outbound, session(1));
        reg.register_preferred(keeper.clone()).await;
        keeper.close();
        let late = stream(id(9), Direction::Inbound, session(8));
        assert!(reg.register_preferred(late.clone()).await);
        assert!(late.is_alive());
    }

    #[tokio::test]
    async fn reregistering_same_stream_keeps_it_alive() {
        let reg = registry();
        let s = stream_for(Keypair::generate().peer_id());
        reg.register(s.clone()).await;
        reg.register(s.clone()).await;
        assert!(s.is_alive());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let reg = registry();
        let peer = Keypair::generate().peer_id();
        let s = stream_for(peer);
        reg.register(s.clone()).await;
        assert!(reg.unregister(&peer).await);
        assert!(!s.is_alive());
        assert!(!reg.unregister(&peer).await);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn stale_stream_cannot_evict_replacement() {
        let reg = PeerRegistry::new(id(5));
        let old = stream(id(9), Direction::Inbound, session(1));
        let new = stream(id(9), Direction::Outbound, session(2));
        reg.register_preferred(old.clone()).await;
        reg.register_preferred(new.clone()).await;

        assert!(!reg.unregister_stream(&old).await);
        assert!(reg.contains(&id(9)).await);
        assert!(new.is_alive());

        assert!(reg.unregister_stream(&new).await);
        assert!(!reg.contains(&id(9)).await);
    }

    #[tokio::test]
    async fn snapshot_is_detached_and_sorted() {
        let reg = registry();
        let ids: Vec<PeerId> = (0..5).map(|_| Keypair::generate().peer_id()).collect();
        for id in &ids {
            reg.register(stream_for(*id)).await;
        }
        let snap = reg.snapshot().await;
        reg.unregister(&ids[0]).await;

        assert_eq!(snap.len(), 5);
        assert!(snap.windows(2).all(|w| w[0].peer_id() < w[1].peer_id()));
        assert_eq!(reg.len().await, 4);
    }

    #[tokio::test]
    async fn close_all_closes_every_stream() {
        let reg = registry();
        let streams: Vec<_> = (0..3)
            .map(|_| stream_for(Keypair::generate().peer_id()))
            .collect();
        for s in &streams {
            reg.register(s.clone()).await;
        }
        assert_eq!(reg.close_all().await, 3);
        assert!(reg.is_empty().await);
        assert!(streams.iter().all(|s| !s.is_alive()));
    }
}
