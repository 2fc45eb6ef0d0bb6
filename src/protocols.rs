//! Capability trait definitions for the overlay core.
//!
//! This module defines the seams between the overlay core and its external
//! collaborators. The topology manager and messaging engine depend only on
//! these traits, never on a concrete transport or storage backend.
//!
//! ## Capabilities
//!
//! | Capability | Trait | Provided by |
//! |------------|-------|-------------|
//! | Live peer | [`PeerConnection`] | the wire transport layer |
//! | Cache digests | [`ChunkStore`] | a content-addressed store |
//!
//! ## Design
//!
//! `PeerConnection::send` is a non-blocking enqueue: forwarding iterates live
//! peers under the topology read lock, so a send must never wait on the wire.
//! Backpressure is the transport's concern; a full outbound queue is a send
//! error like any other and the forwarding loop simply tries the next peer.

use anyhow::Result;

use crate::address::OverlayAddress;
use crate::identity::Identity;
use crate::kademlia::PeerRecord;
use crate::messages::CourierMsg;
use crate::store::Digest;

/// Capability view of a connected peer.
///
/// A live peer can be addressed, keyed by a stable identity, and handed
/// messages. When the connection ends the transport demotes the peer back to
/// a known address via [`record`](PeerConnection::record).
pub trait PeerConnection: Send + Sync {
    /// The peer's overlay address.
    fn address(&self) -> &OverlayAddress;

    /// Stable identity usable as a map key.
    fn identity(&self) -> Identity;

    /// Enqueue a message for delivery to this peer. Must not block.
    fn send(&self, msg: CourierMsg) -> Result<()>;

    /// Ask the transport to tear the connection down.
    fn disconnect(&self, reason: &str);

    /// Persistent address record for this peer, used when the connection
    /// goes away.
    fn record(&self) -> PeerRecord;
}

/// Content-addressed storage used to derive stable cache digests.
pub trait ChunkStore: Send + Sync {
    /// Store the bytes and return their fixed-length digest.
    fn store(&self, bytes: &[u8]) -> Result<Digest>;
}
