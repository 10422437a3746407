use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blake2::digest::Digest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PackerConfig;
use crate::crypto::CryptoEngine;
use crate::crypto::chunk_id::ChunkId;
use crate::crypto::pack_id::{Blake2b256, PackId};
use crate::error::Result;
use crate::repo::format::{ObjectType, pack_object, unpack_object_expect};
use crate::repo::pack::{PackHeaderEntry, PackType};
use crate::storage::{Handle, StorageBackend};

/// Receives the blob locations of every successfully saved pack.
///
/// Implementations are shared between concurrent savers and must do their
/// own locking.
pub trait PackIndex: Send + Sync {
    /// Record where each blob of `pack_id` lives. Storing the same pack
    /// twice must be harmless.
    fn store_pack(&self, pack_id: PackId, blobs: &[PackHeaderEntry]);

    /// Persist pending entries if enough have accumulated.
    fn flush(&self) -> Result<()>;

    /// Persist every pending entry.
    fn flush_all(&self) -> Result<()> {
        self.flush()
    }
}

/// In-memory map from chunk to its pack location.
#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    entries: HashMap<ChunkId, ChunkIndexEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub blob_type: PackType,
    pub pack_id: PackId,
    pub pack_offset: u64,
    pub stored_size: u32,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    /// Add a chunk location. An existing location is kept. Returns `true`
    /// if the chunk was new.
    pub fn add(&mut self, pack_id: PackId, blob: &PackHeaderEntry) -> bool {
        let mut inserted = false;
        self.entries.entry(blob.chunk_id).or_insert_with(|| {
            inserted = true;
            ChunkIndexEntry {
                blob_type: blob.blob_type,
                pack_id,
                pack_offset: blob.offset,
                stored_size: blob.length,
            }
        });
        inserted
    }

    pub fn get(&self, id: &ChunkId) -> Option<&ChunkIndexEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &ChunkIndexEntry)> {
        self.entries.iter()
    }
}

/// One pack's worth of entries in a persisted index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPackEntry {
    pub pack_id: PackId,
    pub blobs: Vec<PackHeaderEntry>,
}

#[derive(Default)]
struct IndexState {
    chunks: ChunkIndex,
    packs: HashSet<PackId>,
    pending: Vec<IndexPackEntry>,
    pending_blobs: usize,
    pending_since: Option<Instant>,
}

impl IndexState {
    fn insert(&mut self, pack_id: PackId, blobs: &[PackHeaderEntry]) -> bool {
        if !self.packs.insert(pack_id) {
            return false;
        }
        for blob in blobs {
            self.chunks.add(pack_id, blob);
        }
        true
    }
}

/// Repository-wide index backed by `index/` files in storage.
///
/// Newly stored packs stay pending in memory until [`PackIndex::flush`]
/// finds the pending set full (by entry count or age) or
/// [`PackIndex::flush_all`] is called.
pub struct MasterIndex {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    full_entries: usize,
    max_age: Duration,
    state: Mutex<IndexState>,
}

impl MasterIndex {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        full_entries: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            storage,
            crypto,
            full_entries,
            max_age,
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn from_config(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        config: &PackerConfig,
    ) -> Self {
        Self::new(
            storage,
            crypto,
            config.index_full_entries,
            config.index_max_age(),
        )
    }

    /// Read every index file in storage into memory.
    pub fn load(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        config: &PackerConfig,
    ) -> Result<Self> {
        let index = Self::from_config(storage, crypto, config);
        let mut files = 0usize;
        {
            let mut state = index.state.lock().unwrap();
            for key in index.storage.list("index")? {
                let Some(data) = index.storage.get(&key)? else {
                    continue;
                };
                let plaintext =
                    unpack_object_expect(&data, ObjectType::ChunkIndex, index.crypto.as_ref())?;
                let packs: Vec<IndexPackEntry> = rmp_serde::from_slice(&plaintext)?;
                for pack in packs {
                    state.insert(pack.pack_id, &pack.blobs);
                }
                files += 1;
            }
            debug!(
                files,
                packs = state.packs.len(),
                chunks = state.chunks.len(),
                "loaded index"
            );
        }
        Ok(index)
    }

    pub fn lookup(&self, id: &ChunkId) -> Option<ChunkIndexEntry> {
        self.state.lock().unwrap().chunks.get(id).copied()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.state.lock().unwrap().chunks.contains(id)
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pack_count(&self) -> usize {
        self.state.lock().unwrap().packs.len()
    }

    /// Blob entries not yet written to storage.
    pub fn pending_blobs(&self) -> usize {
        self.state.lock().unwrap().pending_blobs
    }

    fn is_full(&self, state: &IndexState) -> bool {
        state.pending_blobs >= self.full_entries
            || state
                .pending_since
                .is_some_and(|since| since.elapsed() >= self.max_age)
    }

    fn write_pending(&self, state: &mut IndexState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let plaintext = rmp_serde::to_vec(&state.pending)?;
        let data = pack_object(ObjectType::ChunkIndex, &plaintext, self.crypto.as_ref())?;
        let handle = Handle::index(hex::encode(Blake2b256::digest(&data)));
        self.storage.put(&handle.storage_key(), &data)?;

        debug!(
            key = %handle.storage_key(),
            packs = state.pending.len(),
            blobs = state.pending_blobs,
            "wrote index file"
        );
        state.pending.clear();
        state.pending_blobs = 0;
        state.pending_since = None;
        Ok(())
    }
}

impl PackIndex for MasterIndex {
    fn store_pack(&self, pack_id: PackId, blobs: &[PackHeaderEntry]) {
        let mut state = self.state.lock().unwrap();
        if !state.insert(pack_id, blobs) {
            debug!(pack_id = %pack_id, "pack already indexed");
            return;
        }
        state.pending.push(IndexPackEntry {
            pack_id,
            blobs: blobs.to_vec(),
        });
        state.pending_blobs += blobs.len();
        state.pending_since.get_or_insert_with(Instant::now);
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !self.is_full(&state) {
            return Ok(());
        }
        self.write_pending(&mut state)
    }

    fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.write_pending(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, offset: u64, length: u32) -> PackHeaderEntry {
        PackHeaderEntry {
            blob_type: PackType::Data,
            chunk_id: ChunkId([byte; 32]),
            offset,
            length,
        }
    }

    #[test]
    fn first_location_wins() {
        let mut idx = ChunkIndex::new();
        assert!(idx.add(PackId([1; 32]), &entry(7, 0, 10)));
        assert!(!idx.add(PackId([2; 32]), &entry(7, 50, 10)));
        let e = idx.get(&ChunkId([7; 32])).unwrap();
        assert_eq!(e.pack_id, PackId([1; 32]));
        assert_eq!(e.pack_offset, 0);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn state_ignores_repeated_pack() {
        let mut state = IndexState::default();
        let blobs = [entry(1, 0, 4), entry(2, 4, 4)];
        assert!(state.insert(PackId([3; 32]), &blobs));
        assert!(!state.insert(PackId([3; 32]), &blobs));
        assert_eq!(state.chunks.len(), 2);
        assert_eq!(state.packs.len(), 1);
    }
}
