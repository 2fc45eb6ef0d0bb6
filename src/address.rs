//! # Overlay Addresses and Proximity
//!
//! This module defines the address space the overlay routes over:
//!
//! - [`OverlayAddress`]: a fixed 32-byte position in the address space
//! - [`proximity`]: the bit-prefix distance metric ordering peers into bins
//! - [`Topic`]: a 32-byte message category derived by hashing arbitrary bytes
//!
//! ## Proximity Order
//!
//! Taking the proximity order relative to a fixed point classifies the points
//! of the space into bins: items in bin `n` share exactly `n` leading bits
//! with the reference point, so each successive bin holds addresses at most
//! half as distant as the previous one. Routing a message means handing it to
//! a peer in a strictly higher bin relative to the destination, which bounds
//! the hop count by the address width.

use serde::{Deserialize, Serialize};

/// Byte length of an overlay address.
pub const ADDRESS_LENGTH: usize = 32;

/// Proximity order of two identical addresses (one past the last bit index).
pub const MAX_PROXIMITY: u16 = (ADDRESS_LENGTH * 8) as u16;

/// A position in the overlay address space.
///
/// Immutable once assigned to a node. Addresses are compared by bit prefix,
/// not numerically; see [`proximity`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverlayAddress([u8; ADDRESS_LENGTH]);

impl OverlayAddress {
    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derive an overlay address from identity bytes.
    ///
    /// The derivation is a one-way hash so addresses are uniformly
    /// distributed over the space regardless of key clustering.
    pub fn from_identity_bytes(identity: &[u8; 32]) -> Self {
        Self(blake3::derive_key("sotto overlay address v1", identity))
    }

    /// Generate a random address. Used by the simulation driver and tests.
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        getrandom::getrandom(&mut bytes).expect("system randomness unavailable");
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// XOR distance to another address, as raw bytes.
    ///
    /// Lexicographic comparison of XOR distances refines the proximity-order
    /// bin structure: of two peers in different bins, the one in the higher
    /// bin always compares closer.
    pub fn xor_distance(&self, other: &OverlayAddress) -> [u8; ADDRESS_LENGTH] {
        let mut dist = [0u8; ADDRESS_LENGTH];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Whether the leftmost bytes of this address equal the given prefix.
    ///
    /// A prefix longer than the address never matches.
    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        self.0.get(..prefix.len()) == Some(prefix)
    }

    /// Short hex tag for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for OverlayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OverlayAddress({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Proximity order of two addresses: the index of the first differing bit,
/// or [`MAX_PROXIMITY`] when the addresses are identical.
///
/// Symmetric, and monotone in the sense that closer addresses share longer
/// common prefixes.
pub fn proximity(a: &OverlayAddress, b: &OverlayAddress) -> u16 {
    for (byte_idx, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return (byte_idx * 8) as u16 + diff.leading_zeros() as u16;
        }
    }
    MAX_PROXIMITY
}

/// Lexicographic ordering of XOR distances.
///
/// `Less` means `a` is closer. Total order; equal only for the same address.
pub fn distance_cmp(a: &[u8; ADDRESS_LENGTH], b: &[u8; ADDRESS_LENGTH]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// A 32-byte message category identifier.
///
/// Derived by hashing arbitrary bytes; two distinct inputs hashing to the
/// same topic are treated as one category.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Derive the topic for an arbitrary byte sequence.
    pub fn from_bytes(input: &[u8]) -> Self {
        Self(*blake3::hash(input).as_bytes())
    }

    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
