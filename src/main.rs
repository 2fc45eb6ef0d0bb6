use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use sotto::{
    CourierParams, KadParams, Keypair, Node, OverlayAddress, PeerExpectation, Switchboard, Topic,
};

#[derive(Parser, Debug)]
#[command(name = "sotto")]
#[command(author, version, about = "simulated proximity-routed messaging overlay", long_about = None)]
struct Args {
    /// Number of in-process nodes to simulate.
    #[arg(short, long, default_value_t = 8)]
    nodes: usize,

    /// Payload routed across the overlay once it is saturated.
    #[arg(short, long, default_value = "hello overlay")]
    payload: String,

    /// Maximum dialing rounds before giving up on saturation.
    #[arg(long, default_value_t = 32)]
    rounds: usize,

    /// Interval between peer-pruning ticks, in seconds.
    #[arg(long, default_value_t = 30)]
    prune_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(args.nodes >= 3, "a meaningful overlay needs at least 3 nodes");

    // bring up the in-process overlay
    let board = Switchboard::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
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
        nodes.push(node);
    }
    info!(nodes = nodes.len(), "overlay nodes created");

    // every node learns the full census, then dials what the table suggests
    let (stop_ticks, _) = tokio::sync::watch::channel(false);
    for node in &nodes {
        node.learn_peers(board.census(&node.identity()))?;
        let (tick_tx, tick_rx) = mpsc::channel(1);
        node.start_pruning(tick_rx);
        let interval = Duration::from_secs(args.prune_interval);
        let mut stop = stop_ticks.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tick_tx.send(Instant::now().into_std()).await.is_err() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    for round in 0..args.rounds {
        let mut dialed = 0usize;
        for node in &nodes {
            let (candidate, bin, want) = node.kademlia().suggest_peer();
            if let Some(record) = candidate {
                let peer = board
                    .lookup(&record.address)
                    .context("suggested peer is not on the switchboard")?;
                board.connect(&node.identity(), &peer)?;
                dialed += 1;
            } else if want {
                info!(
                    node = node.address().short_hex(),
                    bin, "table wants fresh peers at bin"
                );
            }
        }
        if dialed == 0 {
            info!(round, "overlay saturated");
            break;
        }
    }

    let census: Vec<OverlayAddress> = nodes.iter().map(|n| *n.address()).collect();
    for node in &nodes {
        let expectation = PeerExpectation::compute(2, node.address(), &census);
        let health = node.kademlia().healthy(&expectation);
        info!(
            node = node.address().short_hex(),
            know_nn = health.know_nn,
            got_nn = health.got_nn,
            full = health.full,
            "health"
        );
    }

    // route one asymmetric message from the first node to the one farthest
    // from it, and wait for delivery
    let sender = &nodes[0];
    let recipient = nodes[1..]
        .iter()
        .max_by(|a, b| {
            let da = sender.address().xor_distance(a.address());
            let db = sender.address().xor_distance(b.address());
            da.cmp(&db)
        })
        .expect("at least two nodes");

    let topic = Topic::from_bytes(b"sotto-demo");
    let (delivered_tx, mut delivered_rx) = mpsc::channel::<Vec<u8>>(1);
    let _sub = recipient.register(&topic, move |payload, _src, _asym, _key| {
        let _ = delivered_tx.try_send(payload.to_vec());
        Ok(())
    });

    let key_id = sender.set_peer_public_key(
        &recipient.public_key(),
        topic,
        Some(recipient.address().as_bytes().to_vec()),
        false,
    );
    info!(
        from = sender.address().short_hex(),
        to = recipient.address().short_hex(),
        "routing message"
    );
    sender.send_asym(&key_id, topic, args.payload.as_bytes())?;

    tokio::select! {
        delivery = delivered_rx.recv() => {
            match delivery {
                Some(payload) => info!(
                    payload = String::from_utf8_lossy(&payload).into_owned(),
                    "message delivered across the overlay"
                ),
                None => warn!("delivery channel closed unexpectedly"),
            }
        }
        _ = time::sleep(Duration::from_secs(10)) => {
            warn!("message was not delivered within 10s");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    println!("{}", sender.kademlia());

    let _ = stop_ticks.send(true);
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
