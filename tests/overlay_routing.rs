//! End-to-end routing tests over the in-process channel transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use sotto::{
    CourierParams, CourierMsg, Envelope, EnvelopeParams, KadParams, Keypair, Node, OverlayAddress,
    PeerExpectation, SealKey, Switchboard, Topic, MAX_PROXIMITY,
};

fn spawn_node(board: &Arc<Switchboard>) -> Arc<Node> {
    let node = Node::new(
        Keypair::generate(),
        KadParams::default(),
        CourierParams::default(),
    );
    board.register(
        node.identity(),
        *node.address(),
        Arc::clone(node.courier()),
        Arc::clone(node.kademlia()),
    );
    node
}

async fn await_payload(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("delivery channel closed")
}

/// A relays to B, B relays to C, C decrypts and dispatches, without A and C
/// ever sharing a connection.
#[tokio::test]
async fn message_relays_through_intermediate_hop() {
    let board = Switchboard::new();
    let a = spawn_node(&board);
    let b = spawn_node(&board);
    let c = spawn_node(&board);

    board.connect(&a.identity(), &b.identity()).unwrap();
    board.connect(&b.identity(), &c.identity()).unwrap();

    let topic = Topic::from_bytes(b"relay-test");
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
    let _sub = c.register(&topic, move |payload, _src, asym, _key| {
        assert!(asym);
        let _ = tx.try_send(payload.to_vec());
        Ok(())
    });

    let key_id = a.set_peer_public_key(
        &c.public_key(),
        topic,
        Some(c.address().as_bytes().to_vec()),
        false,
    );
    a.send_asym(&key_id, topic, b"three nodes, two hops")
        .unwrap();

    assert_eq!(await_payload(&mut rx).await, b"three nodes, two hops");

    // the intermediate hop never saw a plaintext handler dispatch
    assert!(b.topics().is_empty());

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

/// Handlers on other nodes subscribed to the same topic do not fire unless
/// the envelope decrypts for them.
#[tokio::test]
async fn relay_cannot_read_the_envelope() {
    let board = Switchboard::new();
    let a = spawn_node(&board);
    let b = spawn_node(&board);
    let c = spawn_node(&board);

    board.connect(&a.identity(), &b.identity()).unwrap();
    board.connect(&b.identity(), &c.identity()).unwrap();

    let topic = Topic::from_bytes(b"sealed");
    let (c_tx, mut c_rx) = mpsc::channel::<Vec<u8>>(4);
    let (b_tx, b_rx) = mpsc::channel::<Vec<u8>>(4);
    let _sub_c = c.register(&topic, move |payload, _, _, _| {
        let _ = c_tx.try_send(payload.to_vec());
        Ok(())
    });
    let _sub_b = b.register(&topic, move |payload, _, _, _| {
        let _ = b_tx.try_send(payload.to_vec());
        Ok(())
    });

    let key_id = a.set_peer_public_key(
        &c.public_key(),
        topic,
        Some(c.address().as_bytes().to_vec()),
        false,
    );
    a.send_asym(&key_id, topic, b"eyes only").unwrap();

    assert_eq!(await_payload(&mut c_rx).await, b"eyes only");
    let mut b_rx = b_rx;
    assert!(
        timeout(Duration::from_millis(300), b_rx.recv()).await.is_err(),
        "the relay must not dispatch a payload it cannot decrypt"
    );

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

/// Relaying the same serialized message twice within the cache TTL reaches
/// the recipient exactly once.
#[tokio::test]
async fn flood_guard_limits_duplicate_relay() {
    let board = Switchboard::new();
    let a = spawn_node(&board);
    let b = spawn_node(&board);

    board.connect(&a.identity(), &b.identity()).unwrap();

    let topic = Topic::from_bytes(b"dedup");
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
    let _sub = b.register(&topic, move |payload, _, _, _| {
        let _ = tx.try_send(payload.to_vec());
        Ok(())
    });

    let envelope = Envelope::seal(EnvelopeParams {
        topic,
        payload: b"once only",
        padding: vec![0xaa; 16],
        pow_target: 1,
        work_limit: Duration::from_secs(3),
        sender: None,
        key: SealKey::Asymmetric(&b.public_key()),
    })
    .unwrap();
    let msg = CourierMsg {
        to: b.address().as_bytes().to_vec(),
        expire: (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 4) as u32,
        payload: envelope,
    };

    assert!(a.courier().forward(&msg));
    assert!(
        !a.courier().forward(&msg),
        "identical message within the TTL must be deduplicated"
    );

    assert_eq!(await_payload(&mut rx).await, b"once only");
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "the duplicate must not arrive"
    );

    a.shutdown().await;
    b.shutdown().await;
}

/// A peer relaying messages with expiry beyond the accepted window is
/// sanctioned with a disconnect.
#[tokio::test]
async fn invalid_ttl_drops_the_peer() {
    let board = Switchboard::new();
    let a = spawn_node(&board);
    let b = spawn_node(&board);
    board.connect(&a.identity(), &b.identity()).unwrap();

    let envelope = Envelope::seal(EnvelopeParams {
        topic: Topic::from_bytes(b"skewed"),
        payload: b"x",
        padding: vec![0; 16],
        pow_target: 1,
        work_limit: Duration::from_secs(3),
        sender: None,
        key: SealKey::Asymmetric(&b.public_key()),
    })
    .unwrap();
    // destination far from b so the expiry check applies on the relay path
    let mut to = *b.address().as_bytes();
    to[0] ^= 0xff;
    let msg = CourierMsg {
        to: to.to_vec(),
        expire: u32::MAX,
        payload: envelope,
    };

    // push the malformed message straight down a's pipe to b
    a.kademlia().each_live(None, MAX_PROXIMITY, |conn, _, _| {
        conn.send(msg.clone()).unwrap();
        false
    });

    timeout(Duration::from_secs(3), async {
        loop {
            if a.kademlia().population().0 == 0 && b.kademlia().population().0 == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("misbehaving peer was not dropped");

    a.shutdown().await;
    b.shutdown().await;
}

/// Census registration plus suggest-peer dialing saturates a small overlay
/// into a healthy topology.
#[tokio::test]
async fn suggest_peer_saturates_the_overlay() {
    let board = Switchboard::new();
    let nodes: Vec<Arc<Node>> = (0..6).map(|_| spawn_node(&board)).collect();

    for node in &nodes {
        node.learn_peers(board.census(&node.identity())).unwrap();
    }

    for _ in 0..32 {
        let mut dialed = 0usize;
        for node in &nodes {
            let (candidate, _bin, _want) = node.kademlia().suggest_peer();
            if let Some(record) = candidate {
                let peer = board.lookup(&record.address).expect("peer on switchboard");
                board.connect(&node.identity(), &peer).unwrap();
                dialed += 1;
            }
        }
        if dialed == 0 {
            break;
        }
    }

    let census: Vec<OverlayAddress> = nodes.iter().map(|n| *n.address()).collect();
    for node in &nodes {
        let (live, known) = node.kademlia().population();
        assert!(live >= 1, "every node should hold at least one connection");
        assert_eq!(known, nodes.len() - 1);

        let expectation = PeerExpectation::compute(2, node.address(), &census);
        let health = node.kademlia().healthy(&expectation);
        assert!(health.know_nn, "census seeding must cover nearest neighbours");
        assert!(
            health.got_nn,
            "suggest_peer must connect the nearest neighbourhood:\n{}",
            health.table
        );
    }

    for node in &nodes {
        node.shutdown().await;
    }
}
