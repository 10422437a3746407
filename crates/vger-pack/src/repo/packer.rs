use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use blake2::digest::Digest;
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::crypto::CryptoEngine;
use crate::crypto::chunk_id::ChunkId;
use crate::crypto::pack_id::{Blake2b256, PackId};
use crate::error::{PackError, Result};
use crate::hashing::{BackendHasher, HashingWriter};

use super::pack::{PackHeaderEntry, PackType, PackWriter};

const TEMP_PACK_PREFIX: &str = "vger-temp-pack-";

/// Where pack bytes go on their way to the temp file.
///
/// The content hash is always the outermost layer. The backend's secondary
/// digest, when requested, sits between it and the file.
pub(crate) enum PackSink {
    Content(HashingWriter<File, Blake2b256>),
    ContentAndBackend(HashingWriter<HashingWriter<File, BackendHasher>, Blake2b256>),
}

impl PackSink {
    fn new(file: File, backend_hasher: Option<BackendHasher>) -> Self {
        match backend_hasher {
            None => PackSink::Content(HashingWriter::new(file, Blake2b256::new())),
            Some(hasher) => PackSink::ContentAndBackend(HashingWriter::new(
                HashingWriter::new(file, hasher),
                Blake2b256::new(),
            )),
        }
    }

    fn content_id(&self) -> Result<PackId> {
        match self {
            PackSink::Content(w) => PackId::from_digest(&w.sum()),
            PackSink::ContentAndBackend(w) => PackId::from_digest(&w.sum()),
        }
    }

    fn backend_sum(&self) -> Option<Vec<u8>> {
        match self {
            PackSink::Content(_) => None,
            PackSink::ContentAndBackend(w) => Some(w.get_ref().sum()),
        }
    }

    fn into_file(self) -> File {
        match self {
            PackSink::Content(w) => w.into_inner(),
            PackSink::ContentAndBackend(w) => w.into_inner().into_inner(),
        }
    }
}

impl Write for PackSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PackSink::Content(w) => w.write(buf),
            PackSink::ContentAndBackend(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PackSink::Content(w) => w.flush(),
            PackSink::ContentAndBackend(w) => w.flush(),
        }
    }
}

/// An open pack being filled with blobs of one type.
///
/// Backed by a temp file that is removed when the packer is dropped.
pub struct Packer {
    blob_type: PackType,
    writer: PackWriter<PackSink>,
    temp_path: TempPath,
}

impl Packer {
    /// Create a packer over a fresh temp file in `temp_dir` (or the system
    /// temp dir). `backend_hasher` adds the secondary digest layer.
    pub(crate) fn create(
        blob_type: PackType,
        temp_dir: Option<&Path>,
        backend_hasher: Option<BackendHasher>,
        max_blob_size: u32,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PACK_PREFIX);
        let tmp = match temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|source| PackError::TempFile { source })?;
        let (file, temp_path) = tmp.into_parts();

        debug!(
            blob_type = blob_type.as_str(),
            path = %temp_path.display(),
            "created packer"
        );
        Ok(Self {
            blob_type,
            writer: PackWriter::new(blob_type, PackSink::new(file, backend_hasher))
                .with_max_blob_size(max_blob_size),
            temp_path,
        })
    }

    /// Append one already encrypted blob. Returns its offset in the pack.
    pub fn append(&mut self, chunk_id: ChunkId, blob: &[u8]) -> Result<u64> {
        self.writer.add_blob(chunk_id, blob)
    }

    /// Blob bytes written so far.
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    pub fn count(&self) -> usize {
        self.writer.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Whether an earlier append failed part-way. A poisoned packer can
    /// neither take more blobs nor be finalized.
    pub fn is_poisoned(&self) -> bool {
        self.writer.is_poisoned()
    }

    pub fn blob_type(&self) -> PackType {
        self.blob_type
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Write the pack header and close the writer.
    ///
    /// Consumes the packer, so nothing can be appended afterwards and a pack
    /// cannot be finalized twice. On failure the temp file is kept on disk and
    /// its path is part of the error.
    pub fn finalize(self, crypto: &dyn CryptoEngine) -> Result<FinalizedPack> {
        let Packer {
            blob_type,
            writer,
            temp_path,
        } = self;

        let finished = writer.finish(crypto).and_then(|(sink, blobs, summary)| {
            let pack_id = sink.content_id()?;
            Ok((pack_id, sink.backend_sum(), sink.into_file(), blobs, summary))
        });

        match finished {
            Ok((pack_id, backend_hash, file, blobs, summary)) => {
                debug!(
                    pack_id = %pack_id,
                    blob_type = blob_type.as_str(),
                    blobs = summary.blob_count,
                    size = summary.total_size(),
                    "finalized pack"
                );
                Ok(FinalizedPack {
                    pack_id,
                    blob_type,
                    blobs,
                    backend_hash,
                    size: summary.total_size(),
                    file,
                    temp_path,
                })
            }
            Err(e) => Err(PackError::Finalize {
                path: keep_temp_file(temp_path),
                source: Box::new(e),
            }),
        }
    }
}

impl fmt::Debug for Packer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packer")
            .field("blob_type", &self.blob_type)
            .field("count", &self.count())
            .field("size", &self.size())
            .field("temp_path", &self.temp_path)
            .finish()
    }
}

/// A closed pack waiting in its temp file to be uploaded.
///
/// Dropping it removes the temp file. Use [`FinalizedPack::keep`] to leave
/// the file on disk.
#[derive(Debug)]
pub struct FinalizedPack {
    pub pack_id: PackId,
    pub blob_type: PackType,
    pub blobs: Vec<PackHeaderEntry>,
    /// Secondary digest of the file, present when the backend asked for one.
    pub backend_hash: Option<Vec<u8>>,
    /// Total bytes in the temp file, header included.
    pub size: u64,
    pub(crate) file: File,
    pub(crate) temp_path: TempPath,
}

impl FinalizedPack {
    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    /// Detach the temp file from automatic removal and return its path.
    pub fn keep(self) -> PathBuf {
        keep_temp_file(self.temp_path)
    }
}

fn keep_temp_file(temp_path: TempPath) -> PathBuf {
    let path = temp_path.to_path_buf();
    if let Err(e) = temp_path.keep() {
        warn!(path = %path.display(), error = %e.error, "failed to keep temp pack file");
    }
    path
}
