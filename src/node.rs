//! # High-Level Node API
//!
//! A [`Node`] bundles the overlay components (keypair, topology manager and
//! courier) behind the thin control surface operators use:
//!
//! ```ignore
//! let node = Node::new(Keypair::generate(), KadParams::default(), CourierParams::default());
//!
//! let topic = Topic::from_bytes(b"inbox");
//! let sub = node.register(&topic, |payload, _src, _asym, _key| {
//!     println!("got {} bytes", payload.len());
//!     Ok(())
//! });
//!
//! let key_id = node.set_peer_public_key(&peer_key, topic, Some(peer_addr), false);
//! node.send_asym(&key_id, topic, b"hello")?;
//! ```
//!
//! The node owns its background tasks (key garbage collection, and peer
//! pruning when a tick source is attached) and stops them deterministically
//! on [`shutdown`](Node::shutdown).

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::address::{OverlayAddress, Topic};
use crate::courier::{Courier, CourierError, CourierParams, KeyId, SourcePeer, Subscription};
use crate::identity::{EnvelopeKey, Identity, Keypair};
use crate::kademlia::{KadParams, Kademlia, PeerRecord, RegisterError};
use crate::store::MemoryChunkStore;

/// A running overlay node.
pub struct Node {
    identity: Identity,
    address: OverlayAddress,
    kademlia: Arc<Kademlia>,
    courier: Arc<Courier>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Node {
    /// Create a node and start its background tasks. Must be called within
    /// a tokio runtime.
    pub fn new(keypair: Keypair, kad_params: KadParams, courier_params: CourierParams) -> Arc<Self> {
        let identity = keypair.identity();
        let address = OverlayAddress::from_identity_bytes(identity.as_bytes());
        let kademlia = Arc::new(Kademlia::new(address, kad_params));
        let courier = Courier::new(
            Arc::clone(&kademlia),
            keypair,
            Arc::new(MemoryChunkStore::new()),
            courier_params,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let gc_task = courier.spawn_key_gc(shutdown_rx);
        debug!(node = address.short_hex(), "node started");
        Arc::new(Self {
            identity,
            address,
            kademlia,
            courier,
            shutdown,
            tasks: Mutex::new(vec![gc_task]),
        })
    }

    /// The node's stable identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The node's overlay address.
    pub fn address(&self) -> &OverlayAddress {
        &self.address
    }

    /// The public envelope key peers encrypt to when messaging this node.
    pub fn public_key(&self) -> EnvelopeKey {
        self.courier.public_envelope_key()
    }

    pub fn kademlia(&self) -> &Arc<Kademlia> {
        &self.kademlia
    }

    pub fn courier(&self) -> &Arc<Courier> {
        &self.courier
    }

    /// Seed the topology table with known peer addresses.
    pub fn learn_peers(
        &self,
        records: impl IntoIterator<Item = PeerRecord>,
    ) -> Result<(), RegisterError> {
        self.kademlia.register(records)
    }

    /// Link a handler to a topic.
    pub fn register<F>(&self, topic: &Topic, handler: F) -> Subscription
    where
        F: Fn(&[u8], &SourcePeer, bool, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.courier.register(topic, handler)
    }

    /// Topics with registered handlers.
    pub fn topics(&self) -> Vec<Topic> {
        self.courier.topics()
    }

    /// Bind a peer's public envelope key to a topic with a routing hint.
    pub fn set_peer_public_key(
        &self,
        key: &EnvelopeKey,
        topic: Topic,
        address: Option<Vec<u8>>,
        protected: bool,
    ) -> KeyId {
        self.courier.set_peer_public_key(key, topic, address, protected)
    }

    /// Import a symmetric key bound to a topic.
    pub fn set_sym_key(
        &self,
        key: [u8; 32],
        topic: Topic,
        address: Option<Vec<u8>>,
        add_to_cache: bool,
        protected: bool,
    ) -> KeyId {
        self.courier.set_sym_key(key, topic, address, add_to_cache, protected)
    }

    /// Generate and bind a fresh symmetric key.
    pub fn generate_sym_key(
        &self,
        topic: Topic,
        address: Option<Vec<u8>>,
        add_to_cache: bool,
        protected: bool,
    ) -> KeyId {
        self.courier.generate_sym_key(topic, address, add_to_cache, protected)
    }

    /// Fetch symmetric key material by id.
    pub fn sym_key(&self, key_id: &str) -> Option<[u8; 32]> {
        self.courier.sym_key(key_id)
    }

    /// Send a message under a bound symmetric key.
    pub fn send_sym(&self, key_id: &str, topic: Topic, payload: &[u8]) -> Result<(), CourierError> {
        self.courier.send_sym(key_id, topic, payload)
    }

    /// Send a message under a bound public key.
    pub fn send_asym(&self, key_id: &str, topic: Topic, payload: &[u8]) -> Result<(), CourierError> {
        self.courier.send_asym(key_id, topic, payload)
    }

    /// Attach a peer-pruning tick source; each tick trims over-full bins.
    pub fn start_pruning(&self, ticks: mpsc::Receiver<Instant>) {
        let task = self.kademlia.prune(ticks);
        self.tasks.lock().expect("node lock").push(task);
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().expect("node lock").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!(node = self.address.short_hex(), "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_exposes_control_surface() {
        let node = Node::new(
            Keypair::generate(),
            KadParams::default(),
            CourierParams::default(),
        );
        let topic = Topic::from_bytes(b"control");
        assert!(node.topics().is_empty());
        let sub = node.register(&topic, |_, _, _, _| Ok(()));
        assert_eq!(node.topics(), vec![topic]);
        sub.unsubscribe();
        assert!(node.topics().is_empty());

        let key_id = node.generate_sym_key(topic, None, false, false);
        assert!(node.sym_key(&key_id).is_some());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_pruning_and_gc() {
        let node = Node::new(
            Keypair::generate(),
            KadParams::default(),
            CourierParams::default(),
        );
        let (tick_tx, tick_rx) = mpsc::channel(1);
        node.start_pruning(tick_rx);
        drop(tick_tx); // closing the tick source ends the prune loop
        node.shutdown().await;
    }
}
