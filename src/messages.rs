//! # Wire Messages
//!
//! The single wire unit carried hop-by-hop between peers: [`CourierMsg`].
//! Messages are serialized with bincode using fixed-width integer encoding so
//! the byte form is deterministic (the flood-guard cache keys on a digest of
//! it), and deserialized with a size limit to prevent memory exhaustion.
//!
//! ## Message Shape
//!
//! | Field | Meaning |
//! |---|---|
//! | `to` | destination address, 1..=32 bytes; shorter means "any peer sharing this prefix" |
//! | `expire` | unix seconds after which the message is dropped |
//! | `payload` | opaque encrypted [`Envelope`](crate::envelope::Envelope) |

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::address::ADDRESS_LENGTH;
use crate::envelope::Envelope;

/// Maximum size of an envelope payload (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_PAYLOAD_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced and fixed-width
/// integers, so serialization is deterministic across hops.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// Always use this instead of raw `bincode::deserialize` for wire input.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Encapsulates a message transported over the overlay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CourierMsg {
    /// Destination address, possibly a prefix of a full overlay address.
    pub to: Vec<u8>,
    /// Unix-seconds expiry timestamp.
    pub expire: u32,
    /// The encrypted envelope.
    pub payload: Envelope,
}

impl CourierMsg {
    /// Deterministic byte form used to derive the flood-guard cache digest.
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    /// Whether the destination is well-formed: non-empty and no longer than
    /// a full overlay address.
    pub fn destination_valid(&self) -> bool {
        !self.to.is_empty() && self.to.len() <= ADDRESS_LENGTH
    }
}

impl std::fmt::Display for CourierMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CourierMsg(to {})", hex::encode(&self.to))
    }
}
