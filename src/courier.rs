//! # Messaging Engine
//!
//! The courier sends, receives, decrypts and relays envelopes over the
//! topology manager. It owns three registries:
//!
//! - **Key pools**: per-topic bindings of a symmetric or public key
//!   identifier to an optional routing-hint address and a protection flag
//! - **Handlers**: topic-keyed callbacks decrypted payloads are dispatched to
//! - **Flood guard**: a digest-keyed cache of recently relayed messages that
//!   stops routing loops and duplicate relay storms
//!
//! ## Inbound Flow
//!
//! An inbound message is classified by address prefix: if the local address
//! cannot match the destination, the message is relayed onward (after expiry
//! policing); if it can, the courier attempts local decryption and dispatch,
//! and still relays when decryption fails: a matching prefix does not prove
//! the message was for us.
//!
//! Decryption failure, a flood-guard hit, and finding no route are all
//! ordinary outcomes under gossip-style relaying and are reported as boolean
//! results, never errors.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::address::{OverlayAddress, Topic, ADDRESS_LENGTH, MAX_PROXIMITY};
use crate::envelope::{
    Envelope, EnvelopeError, EnvelopeKind, EnvelopeParams, SealKey, SealedMessage,
    DEFAULT_POW_TARGET, DEFAULT_WORK_LIMIT,
};
use crate::identity::{EnvelopeKey, Keypair};
use crate::kademlia::Kademlia;
use crate::messages::CourierMsg;
use crate::protocols::ChunkStore;
use crate::store::Digest;

/// Default byte size of the random padding folded into each envelope.
const DEFAULT_PADDING_SIZE: usize = 16;

/// Default time-to-live for outbound messages.
const DEFAULT_MSG_TTL: Duration = Duration::from_secs(8);

/// Default lifetime of flood-guard cache entries.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

/// Default capacity of the symmetric-key decrypt cache.
const DEFAULT_SYM_KEY_CACHE_CAPACITY: usize = 512;

/// Default interval between key garbage collection sweeps.
const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(60 * 10);

/// Identifier of a key in the courier's pools: random hex for symmetric
/// keys, the hex public key for asymmetric ones.
pub type KeyId = String;

/// Courier configuration parameters.
pub struct CourierParams {
    /// Time-to-live of outbound messages, and the policing window for
    /// inbound expiry timestamps.
    pub msg_ttl: Duration,
    /// How long a digest stays in the flood-guard cache.
    pub cache_ttl: Duration,
    /// Bound on the symmetric-key decrypt cache.
    pub sym_key_cache_capacity: usize,
    /// Random padding bytes per envelope.
    pub padding_size: usize,
    /// Interval between key garbage collection sweeps.
    pub clean_interval: Duration,
    /// Proof-of-work target for sealed envelopes, in leading zero bits.
    pub pow_target: u32,
    /// Budget for the proof-of-work search.
    pub work_limit: Duration,
}

impl Default for CourierParams {
    fn default() -> Self {
        Self {
            msg_ttl: DEFAULT_MSG_TTL,
            cache_ttl: DEFAULT_CACHE_TTL,
            sym_key_cache_capacity: DEFAULT_SYM_KEY_CACHE_CAPACITY,
            padding_size: DEFAULT_PADDING_SIZE,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            pow_target: DEFAULT_POW_TARGET,
            work_limit: DEFAULT_WORK_LIMIT,
        }
    }
}

/// Error type for courier operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourierError {
    /// The key id is not bound for this topic.
    UnknownKey { key: KeyId, topic: Topic },
    /// The key is bound but carries no routing-hint address.
    NoRoutingHint { key: KeyId, topic: Topic },
    /// A zero-length key was passed to send.
    EmptyKey,
    /// The key id does not parse into usable key material.
    InvalidKey { key: KeyId },
    /// Inbound message whose expiry lies beyond the accepted TTL window.
    InvalidTtl,
    /// Inbound message with an empty or over-long destination.
    InvalidDestination,
    /// Envelope-level protocol violation (malformed mode marker).
    Envelope(EnvelopeError),
}

impl std::fmt::Display for CourierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CourierError::UnknownKey { key, topic } => {
                write!(f, "key '{key}' is not bound for topic {topic}")
            }
            CourierError::NoRoutingHint { key, topic } => {
                write!(f, "no address hint for key '{key}' on topic {topic}")
            }
            CourierError::EmptyKey => write!(f, "zero length key passed to send"),
            CourierError::InvalidKey { key } => write!(f, "invalid key id '{key}'"),
            CourierError::InvalidTtl => write!(f, "message expiry beyond accepted TTL window"),
            CourierError::InvalidDestination => write!(f, "malformed destination address"),
            CourierError::Envelope(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CourierError {}

impl From<EnvelopeError> for CourierError {
    fn from(err: EnvelopeError) -> Self {
        CourierError::Envelope(err)
    }
}

/// Capability handle describing the origin of a dispatched message: the
/// routing-hint address bound to the key that decrypted it, when one exists.
pub struct SourcePeer {
    address: Option<Vec<u8>>,
}

impl SourcePeer {
    pub fn address(&self) -> Option<&[u8]> {
        self.address.as_deref()
    }
}

/// Signature of a topic handler.
///
/// Receives the decrypted payload, the source handle, whether the message
/// was asymmetrically encrypted, and the id of the key that decrypted it.
pub type Handler = dyn Fn(&[u8], &SourcePeer, bool, &str) -> anyhow::Result<()> + Send + Sync;

/// A registered topic handler. Consumed by [`unsubscribe`](Subscription::unsubscribe).
pub struct Subscription {
    courier: Weak<Courier>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Remove the handler. Removing the last handler of a topic removes the
    /// topic entry entirely.
    pub fn unsubscribe(self) {
        if let Some(courier) = self.courier.upgrade() {
            courier.deregister(&self.topic, self.id);
        }
    }
}

/// Per-key, per-topic binding of routing information.
struct KeyBinding {
    address: Option<Vec<u8>>,
    protected: bool,
    last_seen: Instant,
}

/// Flood-guard record. An entry with no expiry matches only a repeat from
/// the same originating peer.
struct CacheEntry {
    expires_at: Option<Instant>,
    received_from: Vec<u8>,
}

struct CourierState {
    sym_key_pool: HashMap<KeyId, HashMap<Topic, KeyBinding>>,
    pub_key_pool: HashMap<KeyId, HashMap<Topic, KeyBinding>>,
    sym_keys: HashMap<KeyId, [u8; 32]>,
    /// Recently used symmetric key ids, most recent first. Bounds how many
    /// keys an inbound envelope is tried against.
    decrypt_cache: LruCache<KeyId, ()>,
    fwd_cache: HashMap<Digest, CacheEntry>,
    handlers: HashMap<Topic, HashMap<u64, Arc<Handler>>>,
    handler_seq: u64,
}

/// The messaging engine: encryption, dispatch, deduplication and forwarding
/// over the topology manager.
pub struct Courier {
    kademlia: Arc<Kademlia>,
    keypair: Keypair,
    store: Arc<dyn ChunkStore>,
    params: CourierParams,
    state: Mutex<CourierState>,
}

impl Courier {
    pub fn new(
        kademlia: Arc<Kademlia>,
        keypair: Keypair,
        store: Arc<dyn ChunkStore>,
        params: CourierParams,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(params.sym_key_cache_capacity.max(1))
            .expect("capacity is at least one");
        Arc::new(Self {
            kademlia,
            keypair,
            store,
            params,
            state: Mutex::new(CourierState {
                sym_key_pool: HashMap::new(),
                pub_key_pool: HashMap::new(),
                sym_keys: HashMap::new(),
                decrypt_cache: LruCache::new(capacity),
                fwd_cache: HashMap::new(),
                handlers: HashMap::new(),
                handler_seq: 0,
            }),
        })
    }

    /// The overlay address of this node.
    pub fn base_addr(&self) -> &OverlayAddress {
        self.kademlia.base_addr()
    }

    /// The public envelope key of this node.
    pub fn public_envelope_key(&self) -> EnvelopeKey {
        self.keypair.envelope_key()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Link a handler to a topic. Any number of handlers may exist per
    /// topic; dispatch order across them is unspecified.
    pub fn register<F>(self: &Arc<Self>, topic: &Topic, handler: F) -> Subscription
    where
        F: Fn(&[u8], &SourcePeer, bool, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.state.lock().expect("courier lock");
        state.handler_seq += 1;
        let id = state.handler_seq;
        state
            .handlers
            .entry(*topic)
            .or_default()
            .insert(id, Arc::new(handler));
        Subscription {
            courier: Arc::downgrade(self),
            topic: *topic,
            id,
        }
    }

    fn deregister(&self, topic: &Topic, id: u64) {
        let mut state = self.state.lock().expect("courier lock");
        if let Some(handlers) = state.handlers.get_mut(topic) {
            handlers.remove(&id);
            if handlers.is_empty() {
                state.handlers.remove(topic);
            }
        }
    }

    /// Topics with at least one registered handler.
    pub fn topics(&self) -> Vec<Topic> {
        let state = self.state.lock().expect("courier lock");
        state.handlers.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Classify and handle an inbound message: relay it onward when it
    /// cannot be for us, otherwise attempt local processing, relaying as
    /// well when decryption fails.
    pub fn handle_msg(self: &Arc<Self>, msg: &CourierMsg) -> Result<(), CourierError> {
        if !msg.destination_valid() {
            return Err(CourierError::InvalidDestination);
        }
        if !self.is_self_possible_recipient(msg) {
            let now = unix_now();
            if u64::from(msg.expire) < now {
                trace!(msg = %msg, "expired in transit, dropping");
                return Ok(());
            }
            if u64::from(msg.expire) > now + self.params.msg_ttl.as_secs() {
                return Err(CourierError::InvalidTtl);
            }
            trace!(msg = %msg, node = self.base_addr().short_hex(), "not for us, relaying");
            self.forward(msg);
            return Ok(());
        }
        if !self.process(msg)? {
            // ambiguous prefix match: the true recipient may be downstream
            self.forward(msg);
        }
        Ok(())
    }

    /// Whether the destination fully equals our own address.
    pub fn is_self_recipient(&self, msg: &CourierMsg) -> bool {
        msg.to.as_slice() == self.base_addr().as_bytes()
    }

    /// Whether the leftmost destination bytes match our own address.
    pub fn is_self_possible_recipient(&self, msg: &CourierMsg) -> bool {
        self.base_addr().matches_prefix(&msg.to)
    }

    /// Attempt to decrypt, validate and dispatch a message for which this
    /// node can be the intended recipient. Returns `false` when no key
    /// opens it; a failed decrypt is the normal case on a gossip path.
    pub fn process(self: &Arc<Self>, msg: &CourierMsg) -> Result<bool, CourierError> {
        let envelope = &msg.payload;
        let topic = envelope.topic;
        let (sealed, key_id, from, asymmetric) = match envelope.kind()? {
            EnvelopeKind::Symmetric => match self.process_sym(envelope) {
                Some((sealed, key_id, from)) => (sealed, key_id, from, false),
                None => return Ok(false),
            },
            EnvelopeKind::Asymmetric => match self.process_asym(envelope) {
                Some((sealed, key_id, from)) => (sealed, key_id, from, true),
                None => return Ok(false),
            },
        };

        let handlers: Vec<Arc<Handler>> = {
            let state = self.state.lock().expect("courier lock");
            state
                .handlers
                .get(&topic)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        let source = SourcePeer { address: from };
        for handler in handlers {
            if let Err(err) = handler(&sealed.payload, &source, asymmetric, &key_id) {
                warn!(error = %err, topic = %topic, "message handler failed");
            }
        }

        if msg.to.len() < ADDRESS_LENGTH {
            // partial destination: peers sharing the prefix may also be
            // legitimate recipients, so relay on top of local delivery
            if !self.forward(msg) {
                debug!(msg = %msg, "redundant relay of partial-address message found no route");
            }
        }
        Ok(true)
    }

    /// Try the recently used symmetric keys, most recent first, against a
    /// symmetric envelope.
    fn process_sym(&self, envelope: &Envelope) -> Option<(SealedMessage, KeyId, Option<Vec<u8>>)> {
        let candidates: Vec<KeyId> = {
            let state = self.state.lock().expect("courier lock");
            state.decrypt_cache.iter().map(|(id, _)| id.clone()).collect()
        };
        for key_id in candidates {
            let key = {
                let state = self.state.lock().expect("courier lock");
                state.sym_keys.get(&key_id).copied()
            };
            let Some(key) = key else { continue };
            let Ok(sealed) = envelope.open_symmetric(&key) else {
                continue;
            };
            if !sealed.validate() {
                debug!(key = %key_id, "symmetric envelope opened but failed validation");
                return None;
            }
            let mut state = self.state.lock().expect("courier lock");
            state.decrypt_cache.get(&key_id); // re-mark as most recently used
            let from = state
                .sym_key_pool
                .get_mut(&key_id)
                .and_then(|topics| topics.get_mut(&envelope.topic))
                .and_then(|binding| {
                    binding.last_seen = Instant::now();
                    binding.address.clone()
                });
            return Some((sealed, key_id, from));
        }
        trace!(node = self.base_addr().short_hex(), "no cached symmetric key opens envelope");
        None
    }

    /// Open an asymmetric envelope with our own private key.
    fn process_asym(&self, envelope: &Envelope) -> Option<(SealedMessage, KeyId, Option<Vec<u8>>)> {
        let sealed = match envelope.open_asymmetric(&self.keypair) {
            Ok(sealed) => sealed,
            Err(err) => {
                trace!(node = self.base_addr().short_hex(), error = %err, "asymmetric decrypt failed");
                return None;
            }
        };
        if !sealed.validate() {
            debug!("asymmetric envelope opened but failed validation");
            return None;
        }
        let key_id = sealed
            .src_envelope_key
            .map(|key| key.to_hex())
            .unwrap_or_default();
        let from = {
            let mut state = self.state.lock().expect("courier lock");
            state
                .pub_key_pool
                .get_mut(&key_id)
                .and_then(|topics| topics.get_mut(&envelope.topic))
                .and_then(|binding| {
                    binding.last_seen = Instant::now();
                    binding.address.clone()
                })
        };
        Some((sealed, key_id, from))
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Bind a peer's public envelope key to a topic, with an optional
    /// routing-hint address. Required for asymmetric exchange on the topic.
    /// Returns the key id used with [`send_asym`](Courier::send_asym).
    pub fn set_peer_public_key(
        &self,
        key: &EnvelopeKey,
        topic: Topic,
        address: Option<Vec<u8>>,
        protected: bool,
    ) -> KeyId {
        let key_id = key.to_hex();
        let mut state = self.state.lock().expect("courier lock");
        state.pub_key_pool.entry(key_id.clone()).or_default().insert(
            topic,
            KeyBinding {
                address,
                protected,
                last_seen: Instant::now(),
            },
        );
        trace!(key = %key_id, topic = %topic, "bound public key");
        key_id
    }

    /// Generate a fresh symmetric key bound to a topic.
    pub fn generate_sym_key(
        &self,
        topic: Topic,
        address: Option<Vec<u8>>,
        add_to_cache: bool,
        protected: bool,
    ) -> KeyId {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        self.set_sym_key(key, topic, address, add_to_cache, protected)
    }

    /// Import a symmetric key and bind it to a topic. With `add_to_cache`
    /// the key joins the pool tried against inbound symmetric envelopes.
    pub fn set_sym_key(
        &self,
        key: [u8; 32],
        topic: Topic,
        address: Option<Vec<u8>>,
        add_to_cache: bool,
        protected: bool,
    ) -> KeyId {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let key_id = hex::encode(id_bytes);

        let mut state = self.state.lock().expect("courier lock");
        state.sym_keys.insert(key_id.clone(), key);
        state.sym_key_pool.entry(key_id.clone()).or_default().insert(
            topic,
            KeyBinding {
                address,
                protected,
                last_seen: Instant::now(),
            },
        );
        if add_to_cache {
            state.decrypt_cache.put(key_id.clone(), ());
        }
        trace!(key = %key_id, topic = %topic, cached = add_to_cache, "bound symmetric key");
        key_id
    }

    /// Fetch stored symmetric key material by id.
    pub fn sym_key(&self, key_id: &str) -> Option<[u8; 32]> {
        let state = self.state.lock().expect("courier lock");
        state.sym_keys.get(key_id).copied()
    }

    /// Remove every unprotected symmetric key binding whose key id is absent
    /// from the recent-decrypt cache. Protected bindings survive
    /// indefinitely. Returns the number of removed bindings.
    pub fn clean_keys(&self) -> usize {
        let mut state = self.state.lock().expect("courier lock");
        let cached: HashSet<KeyId> = state.decrypt_cache.iter().map(|(id, _)| id.clone()).collect();
        let mut removed = 0usize;
        for (key_id, topics) in state.sym_key_pool.iter_mut() {
            topics.retain(|topic, binding| {
                if binding.protected || cached.contains(key_id) {
                    return true;
                }
                trace!(key = %key_id, topic = %topic, "collecting expired key binding");
                removed += 1;
                false
            });
        }
        state.sym_key_pool.retain(|_, topics| !topics.is_empty());
        removed
    }

    /// Spawn the periodic key garbage collection task. Stops cooperatively
    /// when the shutdown signal fires; a sweep in progress completes.
    pub fn spawn_key_gc(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let courier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(courier.params.clean_interval);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = courier.clean_keys();
                        if removed > 0 {
                            debug!(removed, "collected expired key bindings");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("key garbage collection stopping");
                        break;
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a message under a bound symmetric key.
    pub fn send_sym(
        self: &Arc<Self>,
        key_id: &str,
        topic: Topic,
        payload: &[u8],
    ) -> Result<(), CourierError> {
        let (key, to) = {
            let state = self.state.lock().expect("courier lock");
            let key = state
                .sym_keys
                .get(key_id)
                .copied()
                .ok_or_else(|| CourierError::UnknownKey {
                    key: key_id.to_string(),
                    topic,
                })?;
            let binding = state
                .sym_key_pool
                .get(key_id)
                .and_then(|topics| topics.get(&topic))
                .ok_or_else(|| CourierError::UnknownKey {
                    key: key_id.to_string(),
                    topic,
                })?;
            let to = binding.address.clone().ok_or_else(|| CourierError::NoRoutingHint {
                key: key_id.to_string(),
                topic,
            })?;
            (key, to)
        };
        self.send(to, topic, payload, false, &key)
    }

    /// Send a message under a bound public key. The key id is the hex form
    /// of the recipient's envelope key.
    pub fn send_asym(
        self: &Arc<Self>,
        key_id: &str,
        topic: Topic,
        payload: &[u8],
    ) -> Result<(), CourierError> {
        let key = EnvelopeKey::from_hex(key_id).ok_or_else(|| CourierError::InvalidKey {
            key: key_id.to_string(),
        })?;
        let to = {
            let state = self.state.lock().expect("courier lock");
            let binding = state
                .pub_key_pool
                .get(key_id)
                .and_then(|topics| topics.get(&topic))
                .ok_or_else(|| CourierError::UnknownKey {
                    key: key_id.to_string(),
                    topic,
                })?;
            binding.address.clone().ok_or_else(|| CourierError::NoRoutingHint {
                key: key_id.to_string(),
                topic,
            })?
        };
        self.send(to, topic, payload, true, key.as_bytes())
    }

    /// Build an envelope around the payload and relay it toward the
    /// destination. Payload agnostic; fails on empty key material before
    /// touching the network.
    pub fn send(
        self: &Arc<Self>,
        to: Vec<u8>,
        topic: Topic,
        payload: &[u8],
        asymmetric: bool,
        key: &[u8],
    ) -> Result<(), CourierError> {
        if key.is_empty() {
            return Err(CourierError::EmptyKey);
        }
        let key_bytes: [u8; 32] = key.try_into().map_err(|_| CourierError::InvalidKey {
            key: hex::encode(key),
        })?;

        let mut padding = vec![0u8; self.params.padding_size];
        rand::thread_rng().fill_bytes(&mut padding);

        let recipient_key = EnvelopeKey::from_bytes(key_bytes);
        let seal_key = if asymmetric {
            SealKey::Asymmetric(&recipient_key)
        } else {
            SealKey::Symmetric(&key_bytes)
        };
        let envelope = Envelope::seal(EnvelopeParams {
            topic,
            payload,
            padding,
            pow_target: self.params.pow_target,
            work_limit: self.params.work_limit,
            sender: Some(&self.keypair),
            key: seal_key,
        })?;

        let msg = CourierMsg {
            to,
            expire: (unix_now() + self.params.msg_ttl.as_secs()) as u32,
            payload: envelope,
        };
        if !self.forward(&msg) {
            debug!(msg = %msg, "message accepted by no peer");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Relay a message to the peer(s) closest to its destination.
    ///
    /// The destination may be any prefix length; it is compared against the
    /// most significant bytes of each peer address. Relaying floods within
    /// the neighbourhood depth and along full prefix matches, and otherwise
    /// stops after the first peer tried outside both conditions. Returns
    /// whether at least one peer accepted the message.
    pub fn forward(&self, msg: &CourierMsg) -> bool {
        let mut to = [0u8; ADDRESS_LENGTH];
        let len = msg.to.len().min(ADDRESS_LENGTH);
        to[..len].copy_from_slice(&msg.to[..len]);
        let to_addr = OverlayAddress::from_bytes(to);

        // cache digest is best-effort: an uncached message still relays,
        // with temporarily weaker flood-guard protection
        let digest = match msg.serialize() {
            Ok(bytes) => match self.store.store(&bytes) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(error = %err, "could not store message for flood guard");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "could not serialize message for flood guard");
                None
            }
        };

        if let Some(digest) = &digest {
            if self.check_fwd_cache(None, digest) {
                trace!(
                    node = self.base_addr().short_hex(),
                    msg = %msg,
                    "flood guard hit, dropping relay"
                );
                return false;
            }
        }

        let mut sent = 0usize;
        self.kademlia
            .each_live(Some(&to_addr), MAX_PROXIMITY, |conn, _po, is_proxbin| {
                if let Some(digest) = &digest {
                    if self.check_fwd_cache(Some(conn.address()), digest) {
                        trace!(peer = conn.address().short_hex(), "peer already served this digest");
                        return true;
                    }
                }
                if let Err(err) = conn.send(msg.clone()) {
                    debug!(peer = conn.address().short_hex(), error = %err, "relay attempt failed");
                    return true;
                }
                sent += 1;
                // keep relaying along a full partial-address match or inside
                // the neighbourhood; directed routing stops after the first
                // peer outside both
                if msg.to.len() < ADDRESS_LENGTH && conn.address().matches_prefix(&msg.to) {
                    return true;
                }
                is_proxbin
            });

        if sent == 0 {
            debug!(msg = %msg, "unable to forward to any peers");
            return false;
        }
        if let Some(digest) = &digest {
            self.add_fwd_cache(digest);
        }
        true
    }

    fn check_fwd_cache(&self, peer: Option<&OverlayAddress>, digest: &Digest) -> bool {
        let state = self.state.lock().expect("courier lock");
        if let Some(entry) = state.fwd_cache.get(digest) {
            match entry.expires_at {
                Some(expires_at) if expires_at > Instant::now() => return true,
                None => {
                    if let Some(peer) = peer {
                        if entry.received_from.as_slice() == peer.as_bytes().as_slice() {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
        false
    }

    fn add_fwd_cache(&self, digest: &Digest) {
        let mut state = self.state.lock().expect("courier lock");
        let expires_at = Some(Instant::now() + self.params.cache_ttl);
        state
            .fwd_cache
            .entry(*digest)
            .and_modify(|entry| entry.expires_at = expires_at)
            .or_insert(CacheEntry {
                expires_at,
                received_from: Vec::new(),
            });
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_LENGTH;
    use crate::kademlia::KadParams;
    use crate::store::MemoryChunkStore;
    use crate::testutil::TestPeer;
    use std::sync::Mutex as StdMutex;

    fn addr(first: u8) -> OverlayAddress {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = first;
        OverlayAddress::from_bytes(bytes)
    }

    fn courier_at(base: OverlayAddress) -> (Arc<Courier>, Arc<Kademlia>) {
        let kademlia = Arc::new(Kademlia::new(base, KadParams::default()));
        let courier = Courier::new(
            Arc::clone(&kademlia),
            Keypair::generate(),
            Arc::new(MemoryChunkStore::new()),
            CourierParams {
                cache_ttl: Duration::from_millis(50),
                ..CourierParams::default()
            },
        );
        (courier, kademlia)
    }

    fn full_addr_msg(courier: &Arc<Courier>, to: &OverlayAddress, topic: Topic) -> CourierMsg {
        let envelope = Envelope::seal(EnvelopeParams {
            topic,
            payload: b"payload",
            padding: vec![0xaa; 16],
            pow_target: DEFAULT_POW_TARGET,
            work_limit: DEFAULT_WORK_LIMIT,
            sender: None,
            key: SealKey::Asymmetric(&courier.public_envelope_key()),
        })
        .unwrap();
        CourierMsg {
            to: to.as_bytes().to_vec(),
            expire: (unix_now() + 4) as u32,
            payload: envelope,
        }
    }

    #[test]
    fn empty_key_fails_before_any_send() {
        let (courier, kademlia) = courier_at(addr(0));
        let peer = TestPeer::new(addr(0x80));
        kademlia.mark_live(peer.clone());

        let err = courier
            .send(vec![0x80], Topic::from_bytes(b"t"), b"x", false, &[])
            .unwrap_err();
        assert_eq!(err, CourierError::EmptyKey);
        assert_eq!(peer.sent_count(), 0);
    }

    #[test]
    fn flood_guard_dedups_within_ttl() {
        let (courier, kademlia) = courier_at(addr(0));
        let peer = TestPeer::new(addr(0x80));
        kademlia.mark_live(peer.clone());

        let msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        assert!(courier.forward(&msg));
        assert!(!courier.forward(&msg), "repeat within TTL must be dropped");
        assert_eq!(peer.sent_count(), 1);

        std::thread::sleep(Duration::from_millis(70));
        assert!(courier.forward(&msg), "repeat after TTL expiry relays again");
        assert_eq!(peer.sent_count(), 2);
    }

    #[test]
    fn forward_reports_no_route() {
        let (courier, _kademlia) = courier_at(addr(0));
        let msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        assert!(!courier.forward(&msg));
    }

    #[test]
    fn failed_send_does_not_count_as_delivery() {
        let (courier, kademlia) = courier_at(addr(0));
        let broken = TestPeer::failing(addr(0x80));
        kademlia.mark_live(broken);
        let msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        assert!(!courier.forward(&msg));
    }

    #[test]
    fn expired_message_is_dropped_silently() {
        let (courier, kademlia) = courier_at(addr(0));
        let peer = TestPeer::new(addr(0x80));
        kademlia.mark_live(peer.clone());

        let mut msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        msg.expire = (unix_now() - 10) as u32;
        assert!(courier.handle_msg(&msg).is_ok());
        assert_eq!(peer.sent_count(), 0);
    }

    #[test]
    fn far_future_expiry_is_an_invalid_ttl() {
        let (courier, kademlia) = courier_at(addr(0));
        let peer = TestPeer::new(addr(0x80));
        kademlia.mark_live(peer.clone());

        let mut msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        msg.expire = (unix_now() + 3600) as u32;
        assert_eq!(courier.handle_msg(&msg), Err(CourierError::InvalidTtl));
        assert_eq!(peer.sent_count(), 0);
    }

    #[test]
    fn malformed_destination_is_rejected() {
        let (courier, _) = courier_at(addr(0));
        let mut msg = full_addr_msg(&courier, &addr(0x80), Topic::from_bytes(b"t"));
        msg.to = Vec::new();
        assert_eq!(courier.handle_msg(&msg), Err(CourierError::InvalidDestination));
    }

    #[test]
    fn asymmetric_message_dispatches_to_all_handlers() {
        let base = addr(0);
        let (courier, _) = courier_at(base);
        let topic = Topic::from_bytes(b"inbox");

        let seen: Arc<StdMutex<Vec<(Vec<u8>, bool)>>> = Arc::new(StdMutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            let _ = courier.register(&topic, move |payload, _src, asym, _key| {
                seen.lock().unwrap().push((payload.to_vec(), asym));
                Ok(())
            });
        }

        let msg = full_addr_msg(&courier, &base, topic);
        assert_eq!(courier.process(&msg), Ok(true));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(p, asym)| p == b"payload" && *asym));
    }

    #[test]
    fn handler_errors_do_not_abort_dispatch() {
        let base = addr(0);
        let (courier, _) = courier_at(base);
        let topic = Topic::from_bytes(b"inbox");

        let delivered = Arc::new(StdMutex::new(0usize));
        let _ = courier.register(&topic, move |_, _, _, _| anyhow::bail!("handler exploded"));
        {
            let delivered = Arc::clone(&delivered);
            let _ = courier.register(&topic, move |_, _, _, _| {
                *delivered.lock().unwrap() += 1;
                Ok(())
            });
        }

        let msg = full_addr_msg(&courier, &base, topic);
        assert_eq!(courier.process(&msg), Ok(true));
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[test]
    fn undecryptable_message_reports_false() {
        let base = addr(0);
        let (courier, _) = courier_at(base);
        let (other, _) = courier_at(addr(1));

        // sealed for a different node's key
        let msg = full_addr_msg(&other, &base, Topic::from_bytes(b"t"));
        assert_eq!(courier.process(&msg), Ok(false));
    }

    #[test]
    fn malformed_marker_is_a_protocol_violation() {
        let base = addr(0);
        let (courier, _) = courier_at(base);
        let mut msg = full_addr_msg(&courier, &base, Topic::from_bytes(b"t"));
        msg.payload = msg.payload.corrupt_marker_for_tests();
        assert!(matches!(
            courier.process(&msg),
            Err(CourierError::Envelope(EnvelopeError::MalformedMarker { .. }))
        ));
    }

    #[test]
    fn symmetric_path_resolves_key_and_hint() {
        let base = addr(0);
        let (courier, _) = courier_at(base);
        let topic = Topic::from_bytes(b"sym");
        let key = [9u8; 32];
        let hint = vec![0x42, 0x43];
        let key_id = courier.set_sym_key(key, topic, Some(hint.clone()), true, false);

        let seen: Arc<StdMutex<Vec<(String, Option<Vec<u8>>)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            let _ = courier.register(&topic, move |_, src, asym, kid| {
                assert!(!asym);
                seen.lock()
                    .unwrap()
                    .push((kid.to_string(), src.address().map(|a| a.to_vec())));
                Ok(())
            });
        }

        let envelope = Envelope::seal(EnvelopeParams {
            topic,
            payload: b"shared secret",
            padding: vec![0; 16],
            pow_target: DEFAULT_POW_TARGET,
            work_limit: DEFAULT_WORK_LIMIT,
            sender: None,
            key: SealKey::Symmetric(&key),
        })
        .unwrap();
        let msg = CourierMsg {
            to: base.as_bytes().to_vec(),
            expire: (unix_now() + 4) as u32,
            payload: envelope,
        };
        assert_eq!(courier.process(&msg), Ok(true));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(key_id, Some(hint))]);
    }

    #[test]
    fn send_sym_requires_binding_and_hint() {
        let (courier, _) = courier_at(addr(0));
        let topic = Topic::from_bytes(b"t");

        assert!(matches!(
            courier.send_sym("no-such-key", topic, b"x"),
            Err(CourierError::UnknownKey { .. })
        ));

        let key_id = courier.set_sym_key([1u8; 32], topic, None, false, false);
        assert!(matches!(
            courier.send_sym(&key_id, topic, b"x"),
            Err(CourierError::NoRoutingHint { .. })
        ));

        let other_topic = Topic::from_bytes(b"other");
        assert!(matches!(
            courier.send_sym(&key_id, other_topic, b"x"),
            Err(CourierError::UnknownKey { .. })
        ));
    }

    #[test]
    fn send_asym_requires_binding_and_hint() {
        let (courier, _) = courier_at(addr(0));
        let topic = Topic::from_bytes(b"t");
        let peer_key = Keypair::generate().envelope_key();

        assert!(matches!(
            courier.send_asym("not-hex", topic, b"x"),
            Err(CourierError::InvalidKey { .. })
        ));
        assert!(matches!(
            courier.send_asym(&peer_key.to_hex(), topic, b"x"),
            Err(CourierError::UnknownKey { .. })
        ));

        let key_id = courier.set_peer_public_key(&peer_key, topic, None, false);
        assert!(matches!(
            courier.send_asym(&key_id, topic, b"x"),
            Err(CourierError::NoRoutingHint { .. })
        ));
    }

    #[test]
    fn unprotected_uncached_keys_are_collected() {
        let (courier, _) = courier_at(addr(0));
        let topic = Topic::from_bytes(b"t");
        let stale = courier.set_sym_key([1u8; 32], topic, None, false, false);
        let protected = courier.set_sym_key([2u8; 32], topic, None, false, true);
        let cached = courier.set_sym_key([3u8; 32], topic, None, true, false);

        assert_eq!(courier.clean_keys(), 1);

        assert!(courier.send_sym(&stale, topic, b"x").is_err());
        // protected and cached bindings survive; they fail later on the
        // missing routing hint, not on the binding lookup
        assert!(matches!(
            courier.send_sym(&protected, topic, b"x"),
            Err(CourierError::NoRoutingHint { .. })
        ));
        assert!(matches!(
            courier.send_sym(&cached, topic, b"x"),
            Err(CourierError::NoRoutingHint { .. })
        ));
    }

    #[test]
    fn unsubscribing_last_handler_removes_topic() {
        let (courier, _) = courier_at(addr(0));
        let topic = Topic::from_bytes(b"t");
        let first = courier.register(&topic, |_, _, _, _| Ok(()));
        let second = courier.register(&topic, |_, _, _, _| Ok(()));
        assert_eq!(courier.topics(), vec![topic]);

        first.unsubscribe();
        assert_eq!(courier.topics(), vec![topic]);
        second.unsubscribe();
        assert!(courier.topics().is_empty());
    }

    #[tokio::test]
    async fn key_gc_task_stops_on_shutdown() {
        let (courier, _) = courier_at(addr(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = courier.spawn_key_gc(shutdown_rx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("gc task must stop on signal")
            .unwrap();
    }
}
