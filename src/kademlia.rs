//! # Overlay Topology Manager
//!
//! A table of live peer connections and a database of known peer addresses,
//! both organized by bit-proximity to the node's own address.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `register(records)` | learn new peer addresses (first-seen semantics) |
//! | `mark_live(conn)` | promote a peer to the live set, recompute depth |
//! | `mark_offline(addr)` | demote a peer back to known-only |
//! | `each_live(ref, po, f)` | visit live peers nearest the reference first |
//! | `suggest_peer()` | pick the next known peer worth dialing |
//! | `prune(ticks)` | drop the oldest peers of over-full bins |
//!
//! ## Structure
//!
//! Peer entries live in an arena of slots addressed by stable integer
//! handles; the known and live indexes are handle lists grouped per proximity
//! bin. Entries are never deleted: a peer whose redial budget is exhausted
//! simply stops being suggested. A peer is a tagged state (a bare address
//! record, or a live connection capability), so promotion and demotion are
//! state swaps on the same slot.
//!
//! The table is read-mostly: many concurrent readers iterate it during
//! forwarding while liveness transitions take the write lock briefly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::address::{distance_cmp, proximity, OverlayAddress};
use crate::protocols::PeerConnection;

/// Tuning parameters for the topology manager. Immutable after construction.
pub struct KadParams {
    /// Number of proximity rows the rendered table shows.
    pub max_prox_display: usize,
    /// Nearest-neighbour core minimum cardinality.
    pub min_prox_bin_size: usize,
    /// Minimum number of live peers in a bin before it wants more.
    pub min_bin_size: usize,
    /// Maximum number of live peers in a bin before pruning.
    pub max_bin_size: usize,
    /// Initial interval before a peer is first redialed.
    pub retry_interval: std::time::Duration,
    /// Exponent the retry interval grows by between attempts.
    pub retry_exponent: u32,
    /// Maximum number of redial attempts before a peer is written off.
    pub max_retries: u32,
    /// Optional predicate to veto suggesting a peer.
    pub reachable: Option<Box<dyn Fn(&PeerRecord) -> bool + Send + Sync>>,
}

impl Default for KadParams {
    fn default() -> Self {
        Self {
            max_prox_display: 16,
            min_prox_bin_size: 2,
            min_bin_size: 2,
            max_bin_size: 4,
            retry_interval: std::time::Duration::from_millis(4200),
            retry_exponent: 2,
            max_retries: 42,
            reachable: None,
        }
    }
}

/// Persistent knowledge about a peer: its overlay address plus an opaque
/// underlay hint the transport uses to dial it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: OverlayAddress,
    pub underlay: String,
}

impl PeerRecord {
    pub fn new(address: OverlayAddress, underlay: impl Into<String>) -> Self {
        Self {
            address,
            underlay: underlay.into(),
        }
    }

    /// Merge a newer record into this one. The address is immutable; a
    /// non-empty underlay hint from the newer record wins.
    pub fn update(mut self, newer: PeerRecord) -> PeerRecord {
        if !newer.underlay.is_empty() {
            self.underlay = newer.underlay;
        }
        self
    }
}

/// Error type for peer registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// A peer supplied our own address; misbehaving or malicious, the caller
    /// decides the sanction.
    IsSelf { address: OverlayAddress },
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::IsSelf { address } => {
                write!(f, "refusing to register own address {}", address.short_hex())
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// A peer is either a bare address record or a live connection. The record
/// survives promotion so demotion can merge the connection's last view back
/// into it.
enum PeerState {
    Known(PeerRecord),
    Live {
        conn: Arc<dyn PeerConnection>,
        record: PeerRecord,
    },
}

impl PeerState {
    fn address(&self) -> OverlayAddress {
        match self {
            PeerState::Known(rec) => rec.address,
            PeerState::Live { conn, .. } => *conn.address(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, PeerState::Live { .. })
    }
}

/// One arena slot.
struct Entry {
    state: PeerState,
    seen_at: Instant,
    retries: u32,
}

impl Entry {
    fn fresh(state: PeerState) -> Self {
        Self {
            state,
            seen_at: Instant::now(),
            retries: 0,
        }
    }
}

type Handle = usize;

struct Table {
    slots: Vec<Entry>,
    by_address: HashMap<OverlayAddress, Handle>,
    /// All entries, grouped by proximity order to the base address.
    /// Within a bin, insertion order.
    known_bins: BTreeMap<u16, Vec<Handle>>,
    /// Live entries only. Bins are removed when they empty.
    live_bins: BTreeMap<u16, Vec<Handle>>,
    live_count: usize,
    /// Cached saturation depth, refreshed on liveness transitions.
    depth: u16,
}

/// The topology manager: a table of live peers and a database of known peer
/// addresses, queried for next hops and dial candidates.
pub struct Kademlia {
    base: OverlayAddress,
    params: KadParams,
    table: RwLock<Table>,
}

impl Kademlia {
    pub fn new(base: OverlayAddress, params: KadParams) -> Self {
        Self {
            base,
            params,
            table: RwLock::new(Table {
                slots: Vec::new(),
                by_address: HashMap::new(),
                known_bins: BTreeMap::new(),
                live_bins: BTreeMap::new(),
                live_count: 0,
                depth: 0,
            }),
        }
    }

    /// The node's own overlay address.
    pub fn base_addr(&self) -> &OverlayAddress {
        &self.base
    }

    /// Cached neighbourhood depth as of the last liveness transition.
    pub fn depth(&self) -> u16 {
        self.table.read().expect("table lock").depth
    }

    /// Live and known population counts.
    pub fn population(&self) -> (usize, usize) {
        let table = self.table.read().expect("table lock");
        (table.live_count, table.slots.len())
    }

    /// Enter newly learned addresses into the known-peer database.
    ///
    /// Addresses already known are left untouched. Receiving our own address
    /// fails the whole call; earlier records in the batch stay registered.
    pub fn register(&self, records: impl IntoIterator<Item = PeerRecord>) -> Result<(), RegisterError> {
        let mut table = self.table.write().expect("table lock");
        let mut added = 0usize;
        for record in records {
            if record.address == self.base {
                return Err(RegisterError::IsSelf {
                    address: record.address,
                });
            }
            if table.by_address.contains_key(&record.address) {
                continue;
            }
            let po = proximity(&self.base, &record.address);
            let handle = table.slots.len();
            table.by_address.insert(record.address, handle);
            table.slots.push(Entry::fresh(PeerState::Known(record)));
            table.known_bins.entry(po).or_default().push(handle);
            added += 1;
        }
        trace!(added, total = table.slots.len(), "registered peer addresses");
        Ok(())
    }

    /// Promote a peer to the live set. Unknown peers are registered on the
    /// fly. Returns the recomputed neighbourhood depth and whether it
    /// changed.
    pub fn mark_live(&self, conn: Arc<dyn PeerConnection>) -> (u16, bool) {
        let mut table = self.table.write().expect("table lock");
        let address = *conn.address();
        let po = proximity(&self.base, &address);

        match table.by_address.get(&address).copied() {
            Some(handle) => {
                if !table.slots[handle].state.is_live() {
                    let record = match &table.slots[handle].state {
                        PeerState::Known(rec) => rec.clone(),
                        PeerState::Live { record, .. } => record.clone(),
                    };
                    table.slots[handle] = Entry::fresh(PeerState::Live { conn, record });
                    table.live_bins.entry(po).or_default().push(handle);
                    table.live_count += 1;
                }
                // found among live peers already: nothing to do
            }
            None => {
                let handle = table.slots.len();
                let record = conn.record();
                table.by_address.insert(address, handle);
                table.slots.push(Entry::fresh(PeerState::Live { conn, record }));
                table.known_bins.entry(po).or_default().push(handle);
                table.live_bins.entry(po).or_default().push(handle);
                table.live_count += 1;
            }
        }

        let depth = self.neighbourhood_depth(&table);
        let changed = depth != table.depth;
        table.depth = depth;
        debug!(
            peer = address.short_hex(),
            po,
            depth,
            changed,
            "peer live"
        );
        (depth, changed)
    }

    /// Demote a peer from the live set back to known-only.
    ///
    /// Panics if the peer was never registered: demoting an unknown peer is
    /// a programming error in the transport layer, not a runtime condition.
    pub fn mark_offline(&self, address: &OverlayAddress) {
        let mut table = self.table.write().expect("table lock");
        let handle = *table
            .by_address
            .get(address)
            .unwrap_or_else(|| panic!("offline peer {} was never registered", address.short_hex()));

        let entry = &mut table.slots[handle];
        let merged = match &entry.state {
            PeerState::Live { conn, record } => record.clone().update(conn.record()),
            PeerState::Known(_) => {
                trace!(peer = address.short_hex(), "offline peer was not live");
                return;
            }
        };
        *entry = Entry::fresh(PeerState::Known(merged));

        let po = proximity(&self.base, address);
        if let Some(bin) = table.live_bins.get_mut(&po) {
            bin.retain(|&h| h != handle);
            if bin.is_empty() {
                table.live_bins.remove(&po);
            }
        }
        table.live_count -= 1;
        let depth = self.neighbourhood_depth(&table);
        table.depth = depth;
        debug!(peer = address.short_hex(), po, depth, "peer offline");
    }

    /// Visit live peers within `max_po` of the reference address, nearest
    /// first. The third callback argument reports whether the peer lies
    /// within the current neighbourhood depth. Returning `false` stops the
    /// traversal.
    pub fn each_live<F>(&self, reference: Option<&OverlayAddress>, max_po: u16, mut visit: F)
    where
        F: FnMut(&Arc<dyn PeerConnection>, u16, bool) -> bool,
    {
        let table = self.table.read().expect("table lock");
        let reference = reference.unwrap_or(&self.base);
        let depth = self.neighbourhood_depth(&table);
        for (po, handle) in ordered_handles(&table, table.live_bins.values(), reference) {
            if po > max_po {
                continue;
            }
            if let PeerState::Live { conn, .. } = &table.slots[handle].state {
                if !visit(conn, po, po >= depth) {
                    break;
                }
            }
        }
    }

    /// Visit known peer records within `max_po` of the reference address,
    /// nearest first, with the same callback contract as [`each_live`].
    ///
    /// [`each_live`]: Kademlia::each_live
    pub fn each_known<F>(&self, reference: Option<&OverlayAddress>, max_po: u16, mut visit: F)
    where
        F: FnMut(&PeerRecord, u16, bool) -> bool,
    {
        let table = self.table.read().expect("table lock");
        let reference = reference.unwrap_or(&self.base);
        let depth = self.neighbourhood_depth(&table);
        for (po, handle) in ordered_handles(&table, table.known_bins.values(), reference) {
            if po > max_po {
                continue;
            }
            let record = match &table.slots[handle].state {
                PeerState::Known(rec) => rec.clone(),
                PeerState::Live { record, .. } => record.clone(),
            };
            if !visit(&record, po, po >= depth) {
                break;
            }
        }
    }

    /// Suggest a known peer to dial, and possibly a proximity bin the caller
    /// should search for fresh peers at.
    ///
    /// Selection order: first any callable peer inside the nearest-
    /// neighbourhood region, to keep the core cluster saturated; then the
    /// lowest under-filled bin below the depth, treating empty bins below the
    /// first occupied one as maximally needy. `(None, 0, false)` means the
    /// table is locally saturated.
    pub fn suggest_peer(&self) -> (Option<PeerRecord>, u16, bool) {
        let mut table = self.table.write().expect("table lock");
        let depth = self.neighbourhood_depth(&table);

        // a callable neighbour inside the prox bin keeps the nearest
        // neighbour set fully connected
        let nearest: Vec<(u16, Handle)> =
            ordered_handles(&table, table.known_bins.values(), &self.base).collect();
        for (po, handle) in nearest {
            if po < depth {
                break;
            }
            if let Some(record) = self.callable(&mut table.slots[handle]) {
                trace!(peer = record.address.short_hex(), po, "nearest-neighbour candidate");
                return (Some(record), 0, false);
            }
        }

        // walk live bins from the bottom collecting under-filled orders
        let mut bpo: Vec<u16> = Vec::new();
        let mut minsize = self.params.min_bin_size;
        let mut prev: i64 = -1;
        for (&po, handles) in table.live_bins.iter() {
            prev += 1;
            while (prev as u16) < po {
                bpo.push(prev as u16);
                minsize = 0;
                prev += 1;
            }
            if handles.len() < minsize {
                bpo.push(po);
                minsize = handles.len();
            }
            if po >= depth {
                break;
            }
        }
        if bpo.is_empty() {
            // all bins saturated
            return (None, 0, false);
        }

        // pick the first callable candidate known at the neediest order
        let nxt = bpo[0];
        let first_bin = table
            .known_bins
            .range(nxt..)
            .next()
            .map(|(&po, handles)| (po, handles.clone()));
        if let Some((po, handles)) = first_bin {
            if po < depth {
                for handle in handles {
                    if let Some(record) = self.callable(&mut table.slots[handle]) {
                        return (Some(record), 0, false);
                    }
                }
            }
        }

        // no candidate: ask the caller to search for peers at the short bin
        let mut changed = false;
        if nxt < table.depth {
            table.depth = nxt;
            changed = true;
        }
        (None, nxt, changed)
    }

    /// Spawn the pruning task over an externally supplied tick source.
    ///
    /// Each tick disconnects the oldest excess peers of every bin holding
    /// more than `max_bin_size` live peers, down to `min_bin_size`. One tick
    /// is processed fully before the next is considered; the task ends when
    /// the channel closes.
    pub fn prune(self: &Arc<Self>, mut ticks: mpsc::Receiver<Instant>) -> tokio::task::JoinHandle<()> {
        let kad = Arc::clone(self);
        tokio::spawn(async move {
            while ticks.recv().await.is_some() {
                let dropped = kad.prune_once();
                trace!(dropped, "pruned over-full bins");
            }
        })
    }

    fn prune_once(&self) -> usize {
        // pick victims under the read lock, disconnect outside it: teardown
        // re-enters the table through mark_offline
        let mut victims: Vec<Arc<dyn PeerConnection>> = Vec::new();
        {
            let table = self.table.read().expect("table lock");
            for handles in table.live_bins.values() {
                if handles.len() > self.params.max_bin_size {
                    let excess = handles.len() - self.params.min_bin_size;
                    for &handle in handles.iter().take(excess) {
                        if let PeerState::Live { conn, .. } = &table.slots[handle].state {
                            victims.push(Arc::clone(conn));
                        }
                    }
                }
            }
        }
        for conn in &victims {
            conn.disconnect("bin over capacity");
        }
        victims.len()
    }

    /// Diagnostic: how well the live and known sets cover the expected
    /// nearest neighbours, and whether every expected non-empty bin has at
    /// least one live peer.
    pub fn healthy(&self, expectation: &PeerExpectation) -> Health {
        let table = self.table.read().expect("table lock");
        let depth = self.neighbourhood_depth(&table);

        let covered = |live_only: bool| -> bool {
            expectation.nn_set.iter().all(|addr| {
                table.by_address.get(addr).is_some_and(|&h| {
                    let entry = &table.slots[h];
                    (!live_only || entry.state.is_live())
                        && proximity(&self.base, addr) >= depth
                })
            })
        };
        let know_nn = covered(false);
        let got_nn = covered(true);

        let full = (0..expectation.nn_cutoff).all(|po| {
            expectation.empty_bins.contains(&po)
                || table.live_bins.get(&po).is_some_and(|bin| !bin.is_empty())
        });

        Health {
            know_nn,
            got_nn,
            full,
            table: self.render(&table),
        }
    }

    /// Proximity order bounding the nearest `min_prox_bin_size` live peers;
    /// 0 whenever fewer live peers than that exist.
    fn neighbourhood_depth(&self, table: &Table) -> u16 {
        if table.live_count < self.params.min_prox_bin_size {
            return 0;
        }
        let mut remaining = self.params.min_prox_bin_size;
        for (&po, handles) in table.live_bins.iter().rev() {
            if handles.len() >= remaining {
                return po;
            }
            remaining -= handles.len();
        }
        0
    }

    /// Decide whether a known peer may be dialed now, consuming one retry
    /// attempt if so. Not re-entrant for the same entry; callers hold the
    /// write lock.
    fn callable(&self, entry: &mut Entry) -> Option<PeerRecord> {
        let record = match &entry.state {
            PeerState::Known(rec) => rec.clone(),
            PeerState::Live { .. } => return None,
        };
        if entry.retries > self.params.max_retries {
            return None;
        }

        // allowed retries grow with elapsed wait: one per division of the
        // waited time by the (jittered) retry exponent down to the interval
        let jitter: f64 = rand::thread_rng().gen_range(-0.15..=0.15);
        let div = (self.params.retry_exponent as f64 * (1.0 + jitter)).max(1.01);
        let interval = self.params.retry_interval.as_secs_f64();
        let mut allowed = 0u32;
        let mut delta = entry.seen_at.elapsed().as_secs_f64();
        while delta > interval {
            allowed += 1;
            delta /= div;
        }
        if allowed < entry.retries {
            trace!(
                peer = record.address.short_hex(),
                retries = entry.retries,
                allowed,
                "wait does not warrant another retry"
            );
            return None;
        }
        if let Some(reachable) = &self.params.reachable {
            if !reachable(&record) {
                trace!(peer = record.address.short_hex(), "peer temporarily not callable");
                return None;
            }
        }
        entry.retries += 1;
        Some(record)
    }

    fn render(&self, table: &Table) -> String {
        let depth = self.neighbourhood_depth(table);
        let mut rows = Vec::new();
        rows.push(format!(
            "population: {} ({}), MinProxBinSize: {}, MinBinSize: {}, MaxBinSize: {}",
            table.live_count,
            table.slots.len(),
            self.params.min_prox_bin_size,
            self.params.min_bin_size,
            self.params.max_bin_size,
        ));
        let max_row = self.params.max_prox_display;
        for po in 0..max_row {
            if po as u16 == depth {
                rows.push(format!("============ DEPTH: {po} ============"));
            }
            let live = bin_summary(table, &table.live_bins, po, max_row);
            let known = bin_summary(table, &table.known_bins, po, max_row);
            rows.push(format!("{po:03} {live} | {known}"));
        }
        rows.join("\n")
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, address: &OverlayAddress, by: std::time::Duration) {
        let mut table = self.table.write().expect("table lock");
        let handle = table.by_address[address];
        let entry = &mut table.slots[handle];
        entry.seen_at = entry.seen_at.checked_sub(by).expect("backdate underflow");
    }
}

impl std::fmt::Display for Kademlia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read().expect("table lock");
        write!(f, "{}", self.render(&table))
    }
}

/// One display row: peer count plus up to four short labels. Rows past the
/// display cap fold into the last row.
fn bin_summary(
    table: &Table,
    bins: &BTreeMap<u16, Vec<Handle>>,
    row: usize,
    max_row: usize,
) -> String {
    let mut count = 0usize;
    let mut labels: Vec<String> = Vec::new();
    for (&po, handles) in bins {
        if (po as usize).min(max_row - 1) != row {
            continue;
        }
        count += handles.len();
        for &handle in handles {
            if labels.len() < 4 {
                let entry = &table.slots[handle];
                labels.push(format!(
                    "{} ({})",
                    entry.state.address().short_hex(),
                    entry.retries
                ));
            }
        }
    }
    format!("{count:2} {}", labels.join(" "))
}

/// Handles drawn from the given bins, ordered nearest-first relative to a
/// reference address.
fn ordered_handles<'a>(
    table: &Table,
    bins: impl Iterator<Item = &'a Vec<Handle>>,
    reference: &OverlayAddress,
) -> impl Iterator<Item = (u16, Handle)> {
    let mut ordered: Vec<([u8; 32], u16, Handle)> = bins
        .flatten()
        .map(|&handle| {
            let address = table.slots[handle].state.address();
            (
                reference.xor_distance(&address),
                proximity(reference, &address),
                handle,
            )
        })
        .collect();
    ordered.sort_by(|a, b| distance_cmp(&a.0, &b.0));
    ordered.into_iter().map(|(_, po, handle)| (po, handle))
}

/// Expected nearest-neighbour coverage, derived from a global address
/// census. Diagnostic and test use only.
pub struct PeerExpectation {
    pub nn_set: Vec<OverlayAddress>,
    pub empty_bins: Vec<u16>,
    pub nn_cutoff: u16,
}

impl PeerExpectation {
    /// Derive the expectation for `own` from the census of all addresses.
    pub fn compute(
        min_prox_bin_size: usize,
        own: &OverlayAddress,
        all: &[OverlayAddress],
    ) -> Self {
        let mut others: Vec<OverlayAddress> =
            all.iter().filter(|a| *a != own).copied().collect();
        others.sort_by(|a, b| distance_cmp(&own.xor_distance(a), &own.xor_distance(b)));

        let nn_cutoff = if others.len() < min_prox_bin_size {
            0
        } else {
            proximity(own, &others[min_prox_bin_size - 1])
        };
        let nn_set: Vec<OverlayAddress> = others
            .iter()
            .filter(|a| proximity(own, a) >= nn_cutoff)
            .copied()
            .collect();
        let empty_bins: Vec<u16> = (0..nn_cutoff)
            .filter(|po| !others.iter().any(|a| proximity(own, a) == *po))
            .collect();

        Self {
            nn_set,
            empty_bins,
            nn_cutoff,
        }
    }
}

/// Health state of the topology.
pub struct Health {
    /// Whether the node knows all its expected nearest neighbours.
    pub know_nn: bool,
    /// Whether the node is connected to all its expected nearest neighbours.
    pub got_nn: bool,
    /// Whether every expected non-empty bin has at least one live peer.
    pub full: bool,
    /// Rendered table for operator eyes.
    pub table: String,
}
