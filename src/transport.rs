//! # In-Process Channel Transport
//!
//! A simulation fabric wiring courier nodes together with bounded in-memory
//! pipes. It stands in for the real wire transport, which is an external
//! collaborator of the overlay core: the only things the core ever sees are
//! [`PeerConnection`] capabilities and liveness transitions.
//!
//! ## Behaviour
//!
//! - [`Switchboard::connect`] creates one bounded pipe per direction, hands
//!   each side a [`PeerConnection`] for the other, and promotes both peers
//!   to live in their respective topology tables.
//! - A reader task per direction feeds inbound messages into
//!   [`Courier::handle_msg`]. A protocol violation from the courier tears
//!   the connection down; that is the sanction available to a relay.
//! - Sends are non-blocking enqueues; a full pipe is a send failure the
//!   forwarding loop skips over.
//! - Closing either direction demotes the peer on both sides.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::address::OverlayAddress;
use crate::courier::Courier;
use crate::identity::Identity;
use crate::kademlia::{Kademlia, PeerRecord};
use crate::messages::CourierMsg;
use crate::protocols::PeerConnection;

/// Outbound queue capacity per connection direction.
const PIPE_CAPACITY: usize = 64;

enum Frame {
    Msg(Box<CourierMsg>),
    Close,
}

/// One registered node as the switchboard sees it.
#[derive(Clone)]
struct Endpoint {
    identity: Identity,
    address: OverlayAddress,
    courier: Arc<Courier>,
    kademlia: Arc<Kademlia>,
}

impl Endpoint {
    fn record(&self) -> PeerRecord {
        PeerRecord::new(self.address, self.identity.to_string())
    }
}

/// A live peer capability backed by an in-memory pipe.
struct ChannelPeer {
    remote_address: OverlayAddress,
    remote_identity: Identity,
    tx: mpsc::Sender<Frame>,
}

impl PeerConnection for ChannelPeer {
    fn address(&self) -> &OverlayAddress {
        &self.remote_address
    }

    fn identity(&self) -> Identity {
        self.remote_identity
    }

    fn send(&self, msg: CourierMsg) -> Result<()> {
        self.tx
            .try_send(Frame::Msg(Box::new(msg)))
            .map_err(|_| anyhow::anyhow!("outbound queue full or connection closed"))
    }

    fn disconnect(&self, reason: &str) {
        trace!(peer = self.remote_address.short_hex(), reason, "closing connection");
        let _ = self.tx.try_send(Frame::Close);
    }

    fn record(&self) -> PeerRecord {
        PeerRecord::new(self.remote_address, self.remote_identity.to_string())
    }
}

/// The in-process network: registered nodes plus the set of open links.
pub struct Switchboard {
    endpoints: Mutex<HashMap<Identity, Endpoint>>,
    links: Mutex<HashSet<(Identity, Identity)>>,
}

impl Switchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            links: Mutex::new(HashSet::new()),
        })
    }

    /// Register a node with the fabric so peers can dial it.
    pub fn register(
        &self,
        identity: Identity,
        address: OverlayAddress,
        courier: Arc<Courier>,
        kademlia: Arc<Kademlia>,
    ) {
        let endpoint = Endpoint {
            identity,
            address,
            courier,
            kademlia,
        };
        self.endpoints
            .lock()
            .expect("switchboard lock")
            .insert(identity, endpoint);
    }

    /// Resolve the identity listening on an overlay address.
    pub fn lookup(&self, address: &OverlayAddress) -> Option<Identity> {
        self.endpoints
            .lock()
            .expect("switchboard lock")
            .values()
            .find(|e| e.address == *address)
            .map(|e| e.identity)
    }

    /// The address records of every registered node except `own`, for
    /// seeding topology tables.
    pub fn census(&self, own: &Identity) -> Vec<PeerRecord> {
        self.endpoints
            .lock()
            .expect("switchboard lock")
            .values()
            .filter(|e| e.identity != *own)
            .map(|e| e.record())
            .collect()
    }

    /// Open a bidirectional connection between two registered nodes.
    /// Idempotent for an already-open link.
    pub fn connect(self: &Arc<Self>, a: &Identity, b: &Identity) -> Result<()> {
        if a == b {
            bail!("refusing to connect a node to itself");
        }
        let (ea, eb) = {
            let endpoints = self.endpoints.lock().expect("switchboard lock");
            (
                endpoints.get(a).cloned().context("unknown dialing node")?,
                endpoints.get(b).cloned().context("unknown dialed node")?,
            )
        };
        let key = link_key(a, b);
        {
            let mut links = self.links.lock().expect("switchboard lock");
            if !links.insert(key) {
                return Ok(()); // already connected
            }
        }

        let (tx_ab, rx_ab) = mpsc::channel(PIPE_CAPACITY);
        let (tx_ba, rx_ba) = mpsc::channel(PIPE_CAPACITY);

        // each side holds a capability for the other
        let peer_b: Arc<dyn PeerConnection> = Arc::new(ChannelPeer {
            remote_address: eb.address,
            remote_identity: eb.identity,
            tx: tx_ab.clone(),
        });
        let peer_a: Arc<dyn PeerConnection> = Arc::new(ChannelPeer {
            remote_address: ea.address,
            remote_identity: ea.identity,
            tx: tx_ba.clone(),
        });
        ea.kademlia.mark_live(peer_b);
        eb.kademlia.mark_live(peer_a);

        let board = Arc::downgrade(self);
        let eb_address = eb.address;
        tokio::spawn(read_loop(ea.clone(), eb_address, rx_ba, tx_ab, board.clone(), key));
        tokio::spawn(read_loop(eb, ea.address, rx_ab, tx_ba, board, key));
        debug!(
            a = ea.address.short_hex(),
            b = eb_address.short_hex(),
            "connected"
        );
        Ok(())
    }
}

fn link_key(a: &Identity, b: &Identity) -> (Identity, Identity) {
    if a.as_bytes() <= b.as_bytes() {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

/// Feed inbound frames into the courier until the pipe closes. On exit the
/// remote peer is demoted and the reverse direction is closed too.
async fn read_loop(
    endpoint: Endpoint,
    remote_address: OverlayAddress,
    mut rx: mpsc::Receiver<Frame>,
    echo_tx: mpsc::Sender<Frame>,
    board: Weak<Switchboard>,
    key: (Identity, Identity),
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Msg(msg) => {
                if let Err(err) = endpoint.courier.handle_msg(&msg) {
                    // protocol violation: drop the peer
                    warn!(
                        node = endpoint.address.short_hex(),
                        peer = remote_address.short_hex(),
                        error = %err,
                        "dropping misbehaving peer"
                    );
                    break;
                }
            }
            Frame::Close => break,
        }
    }
    endpoint.kademlia.mark_offline(&remote_address);
    let _ = echo_tx.try_send(Frame::Close);
    if let Some(board) = board.upgrade() {
        board.links.lock().expect("switchboard lock").remove(&key);
    }
    trace!(
        node = endpoint.address.short_hex(),
        peer = remote_address.short_hex(),
        "connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Topic;
    use crate::courier::CourierParams;
    use crate::identity::Keypair;
    use crate::kademlia::KadParams;
    use crate::store::MemoryChunkStore;
    use std::time::Duration;

    struct SimNode {
        identity: Identity,
        address: OverlayAddress,
        courier: Arc<Courier>,
        kademlia: Arc<Kademlia>,
    }

    fn sim_node(board: &Arc<Switchboard>) -> SimNode {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let address = OverlayAddress::from_identity_bytes(identity.as_bytes());
        let kademlia = Arc::new(Kademlia::new(address, KadParams::default()));
        let courier = Courier::new(
            Arc::clone(&kademlia),
            keypair,
            Arc::new(MemoryChunkStore::new()),
            CourierParams::default(),
        );
        board.register(identity, address, Arc::clone(&courier), Arc::clone(&kademlia));
        SimNode {
            identity,
            address,
            courier,
            kademlia,
        }
    }

    #[tokio::test]
    async fn connect_promotes_both_sides() {
        let board = Switchboard::new();
        let a = sim_node(&board);
        let b = sim_node(&board);
        board.connect(&a.identity, &b.identity).unwrap();
        assert_eq!(a.kademlia.population().0, 1);
        assert_eq!(b.kademlia.population().0, 1);

        // reconnecting an open link is a no-op
        board.connect(&b.identity, &a.identity).unwrap();
        assert_eq!(a.kademlia.population().0, 1);
    }

    #[tokio::test]
    async fn messages_flow_end_to_end() {
        let board = Switchboard::new();
        let a = sim_node(&board);
        let b = sim_node(&board);
        board.connect(&a.identity, &b.identity).unwrap();

        let topic = Topic::from_bytes(b"transport-test");
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        let _sub = b.courier.register(&topic, move |payload, _, _, _| {
            let _ = tx.try_send(payload.to_vec());
            Ok(())
        });

        let key_id = a.courier.set_peer_public_key(
            &b.courier.public_envelope_key(),
            topic,
            Some(b.address.as_bytes().to_vec()),
            false,
        );
        a.courier.send_asym(&key_id, topic, b"over the wire").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel open");
        assert_eq!(got, b"over the wire");
    }

    #[tokio::test]
    async fn disconnect_demotes_both_sides() {
        let board = Switchboard::new();
        let a = sim_node(&board);
        let b = sim_node(&board);
        board.connect(&a.identity, &b.identity).unwrap();

        // drop the connection from a's side
        a.kademlia.each_live(None, crate::address::MAX_PROXIMITY, |conn, _, _| {
            conn.disconnect("test teardown");
            false
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if a.kademlia.population().0 == 0 && b.kademlia.population().0 == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peers were not demoted");
    }
}
