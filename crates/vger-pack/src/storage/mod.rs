pub mod local_backend;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};

use blake2::digest::DynDigest;

use crate::crypto::pack_id::PackId;
use crate::error::{PackError, Result};
use crate::hashing::BackendHasher;
use crate::repo::pack::PackType;

/// Kind of object a [`Handle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Pack,
    Index,
}

/// Names one object in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
    /// Blob type stored in a pack. Backends may use it to place tree packs
    /// on faster storage. `None` for non-pack objects.
    pub contained_blob_type: Option<PackType>,
}

impl Handle {
    pub fn pack(pack_id: &PackId, blob_type: PackType) -> Self {
        Self {
            file_type: FileType::Pack,
            name: pack_id.to_hex(),
            contained_blob_type: Some(blob_type),
        }
    }

    pub fn index(name: String) -> Self {
        Self {
            file_type: FileType::Index,
            name,
            contained_blob_type: None,
        }
    }

    /// Key under which the object is stored, e.g. `packs/ab/ab12...`.
    pub fn storage_key(&self) -> String {
        match self.file_type {
            FileType::Pack => {
                let shard = self.name.get(..2).unwrap_or(&self.name);
                format!("packs/{shard}/{}", self.name)
            }
            FileType::Index => format!("index/{}", self.name),
        }
    }
}

/// A byte stream of known length that can be read more than once.
///
/// Backends rewind before retrying an upload. `hash` carries the digest
/// computed with the backend's own [`StorageBackend::hasher`], if any.
pub trait RewindReader: Read {
    fn rewind(&mut self) -> io::Result<()>;

    fn length(&self) -> u64;

    fn hash(&self) -> Option<&[u8]>;
}

/// Rewindable reader over a local file, used to upload finished packs.
pub struct FileReader<'a> {
    file: &'a mut File,
    length: u64,
    hash: Option<&'a [u8]>,
    shutdown: Option<&'a AtomicBool>,
}

impl<'a> FileReader<'a> {
    /// Position `file` at its start and wrap it. `length` is the number of
    /// bytes the backend should expect.
    pub fn new(file: &'a mut File, length: u64, hash: Option<&'a [u8]>) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file,
            length,
            hash,
            shutdown: None,
        })
    }

    /// Fail reads once `shutdown` is set, aborting an upload in progress.
    pub fn with_shutdown(mut self, shutdown: Option<&'a AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            // Not ErrorKind::Interrupted: io::copy would silently retry it.
            return Err(io::Error::other("upload cancelled"));
        }
        self.file.read(buf)
    }
}

impl RewindReader for FileReader<'_> {
    fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn hash(&self) -> Option<&[u8]> {
        self.hash
    }
}

/// Abstract key-value object store holding a repository.
///
/// Implementations must be safe to call concurrently for distinct keys.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// All keys below `prefix` (files only).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Durably store the stream under `handle`.
    ///
    /// The default buffers the stream, checks its length and, when both the
    /// reader and [`hasher`](Self::hasher) provide one, the secondary digest,
    /// then delegates to [`put`](Self::put).
    fn save(&self, handle: &Handle, reader: &mut dyn RewindReader) -> Result<()> {
        let key = handle.storage_key();
        reader.rewind()?;
        let mut data = Vec::with_capacity(usize::try_from(reader.length()).unwrap_or(0));
        reader.read_to_end(&mut data)?;
        if data.len() as u64 != reader.length() {
            return Err(PackError::Storage(format!(
                "{key}: read {} bytes, expected {}",
                data.len(),
                reader.length()
            )));
        }
        if let (Some(expected), Some(mut hasher)) = (reader.hash(), self.hasher()) {
            hasher.update(&data);
            if hasher.finalize()[..] != *expected {
                return Err(PackError::HashMismatch(key));
            }
        }
        self.put(&key, &data)
    }

    /// Secondary digest this backend wants computed over uploaded packs.
    /// `None` skips the extra hashing layer entirely.
    fn hasher(&self) -> Option<BackendHasher> {
        None
    }
}
