//! # Content-Addressed Chunk Store
//!
//! The messaging layer derives flood-guard cache keys by storing the
//! serialized message in a content-addressed store and keeping the resulting
//! digest. Only the digest matters to the overlay core; the stored bytes are
//! retained so a mailbox layer can later retrieve recently relayed messages.
//!
//! [`MemoryChunkStore`] is the in-process implementation: digest = blake3 of
//! the content, bounded by chunk count with oldest-first eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;

use crate::protocols::ChunkStore;

/// Fixed-length digest used as a cache key.
pub type Digest = [u8; 32];

/// Default bound on retained chunks.
const DEFAULT_CHUNK_CAPACITY: usize = 4096;

/// In-memory content-addressed store.
///
/// Storing the same bytes twice yields the same digest and keeps one copy.
pub struct MemoryChunkStore {
    inner: Mutex<ChunkMap>,
}

struct ChunkMap {
    chunks: HashMap<Digest, Vec<u8>>,
    order: VecDeque<Digest>,
    capacity: usize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChunkMap {
                chunks: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Fetch stored bytes by digest.
    pub fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.inner.lock().expect("chunk store lock").chunks.get(digest).cloned()
    }

    /// Number of retained chunks.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("chunk store lock").chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn store(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = *blake3::hash(bytes).as_bytes();
        let mut map = self.inner.lock().expect("chunk store lock");
        if map.chunks.insert(digest, bytes.to_vec()).is_none() {
            map.order.push_back(digest);
            while map.order.len() > map.capacity {
                if let Some(evicted) = map.order.pop_front() {
                    map.chunks.remove(&evicted);
                }
            }
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_content_addressed() {
        let store = MemoryChunkStore::new();
        let d1 = store.store(b"hello").unwrap();
        let d2 = store.store(b"hello").unwrap();
        let d3 = store.store(b"world").unwrap();
        assert_eq!(d1, d2);
        assert_ne!(d1, d3);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&d1).as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = MemoryChunkStore::with_capacity(2);
        let d1 = store.store(b"a").unwrap();
        let _ = store.store(b"b").unwrap();
        let _ = store.store(b"c").unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get(&d1).is_none());
    }
}
