//! # Sotto - Proximity-Routed Encrypted Messaging Overlay
//!
//! Sotto is a store-and-forward messaging overlay: a node holds a position
//! in a 256-bit address space, ranks peers by bit-proximity to that
//! position, and relays encrypted envelopes hop-by-hop toward an
//! arbitrary-length destination prefix. Sender and recipient never need a
//! direct connection; a shorter destination prefix trades delivery
//! precision for sender anonymity.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `address` | overlay addresses, proximity metric, topics |
//! | `identity` | Ed25519 identities and derived envelope keys |
//! | `kademlia` | topology manager: known/live peer bins, depth, dial suggestions |
//! | `envelope` | symmetric/asymmetric envelope encryption with PoW stamps |
//! | `courier` | messaging engine: key pools, handlers, flood guard, forwarding |
//! | `messages` | the hop-by-hop wire unit and bounded serialization |
//! | `protocols` | capability traits the core consumes (peers, chunk store) |
//! | `store` | content-addressed digest store backing the flood guard |
//! | `transport` | in-process channel fabric for simulation and tests |
//! | `node` | high-level node bundling the components |
//!
//! ## Concurrency Model
//!
//! Two independent critical sections: the topology table (read-mostly,
//! exclusive-write) and the courier's registries (short per-operation
//! sections). No lock spans both; forwarding only ever reads topology
//! state. Background maintenance (key garbage collection, peer pruning)
//! runs as explicit tasks stopped cooperatively at shutdown.

pub mod address;
pub mod courier;
pub mod envelope;
pub mod identity;
pub mod kademlia;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use address::{proximity, OverlayAddress, Topic, ADDRESS_LENGTH, MAX_PROXIMITY};
pub use courier::{Courier, CourierError, CourierParams, KeyId, SourcePeer, Subscription};
pub use envelope::{Envelope, EnvelopeError, EnvelopeKind, EnvelopeParams, SealKey, SealedMessage};
pub use identity::{EnvelopeKey, Identity, Keypair, SignatureError};
pub use kademlia::{Health, KadParams, Kademlia, PeerExpectation, PeerRecord, RegisterError};
pub use messages::CourierMsg;
pub use node::Node;
pub use protocols::{ChunkStore, PeerConnection};
pub use store::{Digest, MemoryChunkStore};
pub use transport::Switchboard;
