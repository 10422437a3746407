use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::storage::StorageBackend;

use super::pack::PackType;
use super::packer::Packer;

/// Pool of open packers for one blob type.
///
/// The mutex guards pool membership only. Temp file creation and blob writes
/// happen outside it, so callers fill distinct packers in parallel.
pub struct PackerManager {
    blob_type: PackType,
    min_pack_size: u32,
    max_blob_size: u32,
    temp_dir: Option<PathBuf>,
    storage: Arc<dyn StorageBackend>,
    packers: Mutex<Vec<Packer>>,
}

impl PackerManager {
    pub fn new(
        blob_type: PackType,
        storage: Arc<dyn StorageBackend>,
        min_pack_size: u32,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            blob_type,
            min_pack_size,
            max_blob_size: u32::MAX,
            temp_dir,
            storage,
            packers: Mutex::new(Vec::new()),
        }
    }

    /// Packers opened from now on reject blobs longer than `limit`.
    pub fn with_max_blob_size(mut self, limit: u32) -> Self {
        self.max_blob_size = limit;
        self
    }

    pub fn blob_type(&self) -> PackType {
        self.blob_type
    }

    /// Size at which a checked-out packer should be saved instead of released.
    pub fn min_pack_size(&self) -> u32 {
        self.min_pack_size
    }

    /// Check out a pooled packer, or open a new one if the pool is empty.
    ///
    /// Which pooled packer is returned is unspecified.
    pub fn acquire(&self) -> Result<Packer> {
        if let Some(packer) = self.packers.lock().unwrap().pop() {
            return Ok(packer);
        }

        Packer::create(
            self.blob_type,
            self.temp_dir.as_deref(),
            self.storage.hasher(),
            self.max_blob_size,
        )
    }

    /// Return a packer that is not ready to be saved.
    ///
    /// A packer without blobs is dropped (removing its temp file) rather than
    /// pooled, so the pool only ever holds packers with data.
    pub fn release(&self, packer: Packer) {
        if packer.is_empty() {
            debug!(blob_type = self.blob_type.as_str(), "discarding empty packer");
            return;
        }
        let mut pool = self.packers.lock().unwrap();
        pool.push(packer);
        debug!(
            blob_type = self.blob_type.as_str(),
            open = pool.len(),
            "released packer"
        );
    }

    /// Number of pooled packers. Diagnostics only.
    pub fn open_count(&self) -> usize {
        self.packers.lock().unwrap().len()
    }

    /// Remove every pooled packer, e.g. to save them all at the end of a run.
    pub fn take_all(&self) -> Vec<Packer> {
        std::mem::take(&mut *self.packers.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Barrier;

    use super::*;
    use crate::crypto::chunk_id::ChunkId;
    use crate::testutil::MemoryBackend;

    fn manager(dir: &tempfile::TempDir) -> PackerManager {
        PackerManager::new(
            PackType::Data,
            Arc::new(MemoryBackend::new()),
            4 * 1024 * 1024,
            Some(dir.path().to_path_buf()),
        )
    }

    #[test]
    fn acquire_release_empty_is_pool_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        assert_eq!(mgr.open_count(), 0);

        let p = mgr.acquire().unwrap();
        mgr.release(p);
        assert_eq!(mgr.open_count(), 0);

        let mut p = mgr.acquire().unwrap();
        p.append(ChunkId([1; 32]), b"blob").unwrap();
        mgr.release(p);
        assert_eq!(mgr.open_count(), 1);

        let p = mgr.acquire().unwrap();
        assert_eq!(mgr.open_count(), 0);
        mgr.release(p);
        assert_eq!(mgr.open_count(), 1);
    }

    #[test]
    fn acquire_reuses_pooled_packer() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let mut p = mgr.acquire().unwrap();
        p.append(ChunkId([1; 32]), b"abc").unwrap();
        let path = p.temp_path().to_path_buf();
        mgr.release(p);

        let p = mgr.acquire().unwrap();
        assert_eq!(p.temp_path(), path);
        assert_eq!(p.size(), 3);
    }

    #[test]
    fn empty_release_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let p = mgr.acquire().unwrap();
        let path = p.temp_path().to_path_buf();
        mgr.release(p);
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_acquire_returns_distinct_packers() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        // Seed the pool so threads race for pooled and fresh packers alike.
        let seeded: Vec<Packer> = (0..3u8)
            .map(|i| {
                let mut p = mgr.acquire().unwrap();
                p.append(ChunkId([i; 32]), &[i]).unwrap();
                p
            })
            .collect();
        for p in seeded {
            mgr.release(p);
        }
        assert_eq!(mgr.open_count(), 3);

        let threads = 8;
        let barrier = Barrier::new(threads);
        let paths: Vec<PathBuf> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let p = mgr.acquire().unwrap();
                        let path = p.temp_path().to_path_buf();
                        // Hold the packer until every thread has one.
                        barrier.wait();
                        mgr.release(p);
                        path
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), threads);
    }

    #[test]
    fn take_all_drains_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let mut a = mgr.acquire().unwrap();
        let mut b = mgr.acquire().unwrap();
        a.append(ChunkId([1; 32]), b"a").unwrap();
        b.append(ChunkId([2; 32]), b"b").unwrap();
        mgr.release(a);
        mgr.release(b);
        assert_eq!(mgr.open_count(), 2);

        let all = mgr.take_all();
        assert_eq!(all.len(), 2);
        assert_eq!(mgr.open_count(), 0);
        assert!(all.iter().all(|p| p.blob_type() == PackType::Data));
    }

    #[test]
    fn packer_uses_backend_hasher() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PackerManager::new(
            PackType::Tree,
            Arc::new(MemoryBackend::new().with_sha256_hasher()),
            1024,
            Some(dir.path().to_path_buf()),
        );
        let mut p = mgr.acquire().unwrap();
        p.append(ChunkId([9; 32]), b"tree blob").unwrap();
        let pack = p.finalize(&crate::crypto::PlaintextEngine).unwrap();
        assert!(pack.backend_hash.is_some());
        assert_eq!(pack.blob_type, PackType::Tree);
    }
}
