use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use blake2::digest::Digest;
use sha2::Sha256;

use crate::config::PackerConfig;
use crate::crypto::PlaintextEngine;
use crate::crypto::pack_id::PackId;
use crate::error::{PackError, Result};
use crate::hashing::BackendHasher;
use crate::index::PackIndex;
use crate::repo::Repository;
use crate::repo::pack::PackHeaderEntry;
use crate::storage::{Handle, RewindReader, StorageBackend};

static TRACING_INIT: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` applies.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One call to [`StorageBackend::save`] as seen by [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct SaveCall {
    pub key: String,
    pub length: u64,
    pub hash: Option<Vec<u8>>,
}

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    sha256: bool,
    fail_saves: AtomicUsize,
    cancel_during_save: Option<Arc<AtomicBool>>,
    saves: Mutex<Vec<SaveCall>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            sha256: false,
            fail_saves: AtomicUsize::new(0),
            cancel_during_save: None,
            saves: Mutex::new(Vec::new()),
        }
    }

    /// Declare a SHA-256 secondary hasher and verify it on save.
    pub fn with_sha256_hasher(mut self) -> Self {
        self.sha256 = true;
        self
    }

    /// Set `flag` at the start of every save, before any byte is read.
    pub fn with_cancel_during_save(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_during_save = Some(flag);
        self
    }

    /// Reject the next `n` saves.
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> Vec<SaveCall> {
        self.saves.lock().unwrap().clone()
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys = self.list(prefix).unwrap();
        keys.sort();
        keys
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn save(&self, handle: &Handle, reader: &mut dyn RewindReader) -> Result<()> {
        let key = handle.storage_key();
        self.saves.lock().unwrap().push(SaveCall {
            key: key.clone(),
            length: reader.length(),
            hash: reader.hash().map(<[u8]>::to_vec),
        });

        if self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PackError::Storage(format!("{key}: injected save failure")));
        }
        if let Some(flag) = &self.cancel_during_save {
            flag.store(true, Ordering::SeqCst);
        }

        reader.rewind()?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if data.len() as u64 != reader.length() {
            return Err(PackError::Storage(format!("{key}: short read")));
        }
        if self.sha256 {
            let expected = reader
                .hash()
                .ok_or_else(|| PackError::Storage(format!("{key}: missing SHA-256")))?;
            if Sha256::digest(&data).as_slice() != expected {
                return Err(PackError::HashMismatch(key));
            }
        }
        self.put(&key, &data)
    }

    fn hasher(&self) -> Option<BackendHasher> {
        if self.sha256 {
            Some(Box::new(Sha256::new()))
        } else {
            None
        }
    }
}

/// Index that records every call instead of persisting anything.
#[derive(Default)]
pub struct RecordingIndex {
    stored: Mutex<Vec<(PackId, Vec<PackHeaderEntry>)>>,
    flushes: AtomicUsize,
    full_flushes: AtomicUsize,
    fail_flush: AtomicBool,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<(PackId, Vec<PackHeaderEntry>)> {
        self.stored.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::SeqCst)
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }
}

impl PackIndex for RecordingIndex {
    fn store_pack(&self, pack_id: PackId, blobs: &[PackHeaderEntry]) {
        self.stored.lock().unwrap().push((pack_id, blobs.to_vec()));
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(PackError::Storage("injected index flush failure".into()));
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        self.full_flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(PackError::Storage("injected index flush failure".into()));
        }
        Ok(())
    }
}

/// Config with temp files under `dir` and the given threshold.
pub fn test_config(dir: &Path, min_pack_size: u32) -> PackerConfig {
    PackerConfig {
        min_pack_size,
        temp_dir: Some(dir.to_path_buf()),
        ..PackerConfig::default()
    }
}

/// Plaintext repository over `backend` that records index calls.
pub fn test_repo(
    backend: Arc<MemoryBackend>,
    index: Arc<RecordingIndex>,
    config: PackerConfig,
) -> Repository {
    init_tracing();
    Repository::new(backend, Arc::new(PlaintextEngine), index, config)
        .expect("failed to create test repository")
}

/// Number of entries in a temp directory.
pub fn temp_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
