//! LanChat wire protocol: control message types, version and the chat-line envelope.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{PeerId, PublicKey};

/// Current protocol version. Carried in discovery beacons.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default application protocol tag. Both ends must agree or the handshake fails.
pub const DEFAULT_PROTOCOL_ID: &str = "/chat/1.0.0";

/// Default discovery namespace; nodes in other namespaces ignore each other.
pub const DEFAULT_NAMESPACE: &str = "meet";

/// Control messages. Encoding is bincode; framing is length-prefix (see wire module).
/// Chat traffic after the handshake is line-based, see [`ChatLine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence and where to dial.
    Beacon {
        protocol_version: u8,
        namespace: String,
        peer_id: PeerId,
        listen_addr: SocketAddr,
    },
    /// Unicast answer to a beacon, so a new node learns existing ones without
    /// waiting a full beacon interval.
    DiscoveryResponse {
        protocol_version: u8,
        namespace: String,
        peer_id: PeerId,
        listen_addr: SocketAddr,
    },
    /// First frame on every stream, in both directions. The dialer picks
    /// `session`; the acceptor echoes it back.
    Hello {
        protocol_id: String,
        peer_id: PeerId,
        public_key: PublicKey,
        session: Uuid,
    },
}

/// One chat message as carried on a stream: `<origin> <id> <text>\n`.
///
/// `origin` is the node the text was typed on, which differs from the sending
/// stream's peer when the message was relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub origin: PeerId,
    pub id: Uuid,
    pub text: String,
}

impl ChatLine {
    /// New message authored locally, with a fresh random ID.
    pub fn new(origin: PeerId, text: impl Into<String>) -> Self {
        Self {
            origin,
            id: Uuid::new_v4(),
            text: text.into(),
        }
    }

    /// Encode without the trailing newline (the line codec adds it).
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(line: &str) -> Result<Self, EnvelopeError> {
        let mut parts = line.splitn(3, ' ');
        let origin = parts.next().ok_or(EnvelopeError::Missing("origin"))?;
        let id = parts.next().ok_or(EnvelopeError::Missing("id"))?;
        let text = parts.next().ok_or(EnvelopeError::Missing("text"))?;
        let origin = origin
            .parse::<PeerId>()
            .map_err(|e| EnvelopeError::Origin(e.to_string()))?;
        let id = Uuid::try_parse(id).map_err(EnvelopeError::Id)?;
        Ok(Self {
            origin,
            id,
            text: text.to_string(),
        })
    }
}

impl fmt::Display for ChatLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.origin, self.id.simple(), self.text)
    }
}

/// Malformed chat line.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing {0} field")]
    Missing(&'static str),
    #[error("bad origin: {0}")]
    Origin(String),
    #[error("bad message id: {0}")]
    Id(#[from] uuid::Error),
}
