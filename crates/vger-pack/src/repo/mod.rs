pub mod format;
pub mod pack;
pub mod packer;
pub mod packer_manager;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::config::PackerConfig;
use crate::crypto::CryptoEngine;
use crate::crypto::chunk_id::ChunkId;
use crate::crypto::pack_id::PackId;
use crate::error::{PackError, Result};
use crate::index::PackIndex;
use crate::storage::{FileReader, Handle, StorageBackend};

use self::pack::{PackHeaderEntry, PackType, read_pack_header};
use self::packer::{FinalizedPack, Packer};
use self::packer_manager::PackerManager;

/// Return `Interrupted` once the shutdown flag is set.
pub fn check_interrupted(shutdown: Option<&AtomicBool>) -> Result<()> {
    if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
        return Err(PackError::Interrupted);
    }
    Ok(())
}

/// Outcome of a successful pack save.
#[derive(Debug)]
pub struct SavedPack {
    pub pack_id: PackId,
    pub blob_type: PackType,
    pub blob_count: usize,
    pub size: u64,
    /// Set when the pack was stored and indexed but its temp file could not
    /// be removed. Never fatal.
    pub cleanup_error: Option<PackError>,
}

/// A failed save. Carries the finalized pack when it can be saved again.
///
/// Dropping a `SaveError` that still holds a pack removes its temp file.
/// Converting it into a [`PackError`] keeps the file on disk instead.
#[derive(Debug)]
pub struct SaveError {
    pub error: PackError,
    pub pack: Option<FinalizedPack>,
    /// Set when the pack was stored and indexed and only the index flush
    /// failed. Nothing needs to be saved again.
    pub saved: Option<SavedPack>,
}

impl SaveError {
    fn without_pack(error: PackError) -> Self {
        Self {
            error,
            pack: None,
            saved: None,
        }
    }

    fn with_pack(error: PackError, pack: FinalizedPack) -> Self {
        Self {
            error,
            pack: Some(pack),
            saved: None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.error.is_interrupted()
    }

    /// Take the pack back for [`Repository::save_finalized`].
    pub fn into_pack(self) -> Option<FinalizedPack> {
        self.pack
    }
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for SaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl From<SaveError> for PackError {
    fn from(e: SaveError) -> Self {
        if let Some(pack) = e.pack {
            let pack_id = pack.pack_id;
            let path = pack.keep();
            debug!(pack_id = %pack_id, path = %path.display(), "kept temp file of unsaved pack");
        }
        e.error
    }
}

/// Assembles blobs into packs and saves them to a storage backend.
///
/// Shared by reference between worker threads: each worker checks out its
/// own packer, so only pool bookkeeping is serialized.
pub struct Repository {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    index: Arc<dyn PackIndex>,
    config: PackerConfig,
    data_packers: PackerManager,
    tree_packers: PackerManager,
}

impl Repository {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        index: Arc<dyn PackIndex>,
        config: PackerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let manager = |blob_type| {
            PackerManager::new(
                blob_type,
                Arc::clone(&storage),
                config.min_pack_size,
                config.temp_dir.clone(),
            )
            .with_max_blob_size(config.max_blob_size)
        };
        let data_packers = manager(PackType::Data);
        let tree_packers = manager(PackType::Tree);
        Ok(Self {
            storage,
            crypto,
            index,
            config,
            data_packers,
            tree_packers,
        })
    }

    pub fn packer_manager(&self, blob_type: PackType) -> &PackerManager {
        match blob_type {
            PackType::Data => &self.data_packers,
            PackType::Tree => &self.tree_packers,
        }
    }

    /// Pooled packers across both blob types.
    pub fn open_packers(&self) -> usize {
        self.data_packers.open_count() + self.tree_packers.open_count()
    }

    /// Finalize `packer` and save the resulting pack.
    ///
    /// A finalize failure keeps the temp file on disk and hands nothing
    /// back. See [`Repository::save_finalized`] for the rest.
    pub fn save_packer(
        &self,
        packer: Packer,
        shutdown: Option<&AtomicBool>,
    ) -> std::result::Result<SavedPack, SaveError> {
        let pack = packer
            .finalize(self.crypto.as_ref())
            .map_err(SaveError::without_pack)?;
        self.save_finalized(pack, shutdown)
    }

    /// Upload a finalized pack, remove its temp file, and index its blobs.
    ///
    /// The index is only touched after the backend accepted the pack. If the
    /// upload fails or is cancelled, the pack comes back in the error and
    /// nothing is indexed.
    pub fn save_finalized(
        &self,
        mut pack: FinalizedPack,
        shutdown: Option<&AtomicBool>,
    ) -> std::result::Result<SavedPack, SaveError> {
        if let Err(error) = check_interrupted(shutdown) {
            return Err(SaveError::with_pack(error, pack));
        }

        let handle = Handle::pack(&pack.pack_id, pack.blob_type);
        if let Err(e) = self.upload(&handle, &mut pack, shutdown) {
            let error = if check_interrupted(shutdown).is_err() {
                PackError::Interrupted
            } else {
                PackError::Upload {
                    pack_id: pack.pack_id.to_hex(),
                    source: Box::new(e),
                }
            };
            warn!(pack_id = %pack.pack_id, error = %error, "pack upload failed");
            return Err(SaveError::with_pack(error, pack));
        }

        let FinalizedPack {
            pack_id,
            blob_type,
            blobs,
            size,
            file,
            temp_path,
            ..
        } = pack;

        drop(file);
        let path = temp_path.to_path_buf();
        let cleanup_error = match temp_path.close() {
            Ok(()) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                warn!(
                    pack_id = %pack_id,
                    path = %path.display(),
                    error = %source,
                    "failed to remove temp pack file"
                );
                Some(PackError::TempCleanup {
                    pack_id: pack_id.to_hex(),
                    path,
                    source,
                })
            }
        };

        self.index.store_pack(pack_id, &blobs);
        debug!(
            pack_id = %pack_id,
            blob_type = blob_type.as_str(),
            blobs = blobs.len(),
            size,
            "saved pack"
        );

        let saved = SavedPack {
            pack_id,
            blob_type,
            blob_count: blobs.len(),
            size,
            cleanup_error,
        };
        if self.config.auto_index_flush {
            if let Err(e) = self.index.flush() {
                warn!(pack_id = %pack_id, error = %e, "index flush failed after saving pack");
                return Err(SaveError {
                    error: PackError::IndexFlush {
                        pack_id: Some(pack_id.to_hex()),
                        source: Box::new(e),
                    },
                    pack: None,
                    saved: Some(saved),
                });
            }
        }
        Ok(saved)
    }

    fn upload(
        &self,
        handle: &Handle,
        pack: &mut FinalizedPack,
        shutdown: Option<&AtomicBool>,
    ) -> Result<()> {
        let mut reader = FileReader::new(&mut pack.file, pack.size, pack.backend_hash.as_deref())?
            .with_shutdown(shutdown);
        self.storage.save(handle, &mut reader)
    }

    /// Add one encrypted blob to an open pack of `blob_type`, saving the pack
    /// once it reaches the minimum pack size.
    ///
    /// Returns the saved pack, if any. A failed save keeps the temp file on
    /// disk. A rejected blob leaves the packer's earlier blobs pooled.
    pub fn save_blob(
        &self,
        blob_type: PackType,
        chunk_id: ChunkId,
        blob: &[u8],
        shutdown: Option<&AtomicBool>,
    ) -> Result<Option<SavedPack>> {
        let manager = self.packer_manager(blob_type);
        let mut packer = manager.acquire()?;
        if let Err(e) = packer.append(chunk_id, blob) {
            if packer.is_poisoned() {
                warn!(
                    blob_type = blob_type.as_str(),
                    blobs = packer.count(),
                    error = %e,
                    "discarding packer after failed write"
                );
            } else {
                manager.release(packer);
            }
            return Err(e);
        }

        if packer.size() >= u64::from(manager.min_pack_size()) {
            Ok(Some(self.save_packer(packer, shutdown)?))
        } else {
            manager.release(packer);
            Ok(None)
        }
    }

    /// Save every pooled packer regardless of size, then write all pending
    /// index entries.
    ///
    /// Every packer is attempted. The first error is returned; temp files of
    /// packs that failed to save stay on disk.
    pub fn flush(&self, shutdown: Option<&AtomicBool>) -> Result<Vec<SavedPack>> {
        let mut saved = Vec::new();
        let mut first_error = None;

        for manager in [&self.data_packers, &self.tree_packers] {
            for packer in manager.take_all() {
                match self.save_packer(packer, shutdown) {
                    Ok(pack) => saved.push(pack),
                    Err(e) => {
                        let e = PackError::from(e);
                        warn!(
                            blob_type = manager.blob_type().as_str(),
                            error = %e,
                            "failed to save pack during flush"
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.index.flush_all().map_err(|e| PackError::IndexFlush {
            pack_id: None,
            source: Box::new(e),
        })?;
        debug!(packs = saved.len(), "flushed packers");
        Ok(saved)
    }

    /// Read a stored pack and return its blob entries.
    pub fn load_pack_header(&self, pack_id: &PackId) -> Result<Vec<PackHeaderEntry>> {
        let data = self
            .storage
            .get(&pack_id.storage_key())?
            .ok_or_else(|| PackError::Storage(format!("pack {pack_id} not found")))?;
        read_pack_header(&data, self.crypto.as_ref())
    }
}
