//! Connection arbiter: decides which side of a discovered pair dials.

use crate::identity::PeerId;
use crate::stream::Direction;

/// Which side of a peer pair opens the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dial the remote.
    Initiate,
    /// Wait for the remote to dial in.
    Wait,
}

/// True when `local` must dial `remote`: the smaller ID initiates.
///
/// Both sides evaluate this independently with the arguments swapped, so for
/// any pair exactly one of them dials. Equal IDs mean two nodes share an
/// identity, which never happens for generated keypairs.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    debug_assert_ne!(local, remote, "peer IDs must be unique");
    local < remote
}

/// [`should_initiate`] as a [`Role`].
pub fn role(local: &PeerId, remote: &PeerId) -> Role {
    if should_initiate(local, remote) {
        Role::Initiate
    } else {
        Role::Wait
    }
}

/// Direction, as seen from `local`, of the stream the arbiter would open.
/// When a pair ends up with more than one stream, both ends keep this one.
pub fn preferred_direction(local: &PeerId, remote: &PeerId) -> Direction {
    match role(local, remote) {
        Role::Initiate => Direction::Outbound,
        Role::Wait => Direction::Inbound,
    }
}
