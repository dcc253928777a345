//! LanChat core: peer identity, connection arbitration, peer registry and
//! message relay. Owns no sockets; the host hands in handshaken connections.

pub mod arbiter;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod stream;
pub mod wire;

pub use arbiter::{preferred_direction, should_initiate, Role};
pub use identity::{Keypair, PeerId, PublicKey};
pub use protocol::{ChatLine, Message, DEFAULT_NAMESPACE, DEFAULT_PROTOCOL_ID, PROTOCOL_VERSION};
pub use registry::PeerRegistry;
pub use relay::{Delivery, Relay, RelayConfig, RelayMode};
pub use stream::{Direction, PeerConnection, PeerStream};
pub use wire::{decode_frame, encode_frame, FrameError};

