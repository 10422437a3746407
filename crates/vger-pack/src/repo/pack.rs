use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoEngine;
use crate::crypto::chunk_id::ChunkId;
use crate::error::{PackError, Result};

use super::format::{ObjectType, pack_object, unpack_object_expect};

/// Size of the trailing header-length field.
pub const PACK_TRAILER_LEN_SIZE: usize = 4;

/// Distinguishes data packs (file content) from tree packs (directory metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackType {
    Data,
    Tree,
}

impl PackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackType::Data => "data",
            PackType::Tree => "tree",
        }
    }
}

/// One entry in the pack's trailing header. Describes a single blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackHeaderEntry {
    pub blob_type: PackType,
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub length: u32,
}

/// Statistics returned when a pack writer is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackSummary {
    pub blob_count: usize,
    /// Bytes of blob data (everything before the header).
    pub data_size: u64,
    /// Bytes of the encrypted header object plus its length field.
    pub trailer_size: u64,
}

impl PackSummary {
    pub fn total_size(&self) -> u64 {
        self.data_size + self.trailer_size
    }
}

/// Streams encrypted blobs into `W` and closes the pack with a trailing header.
///
/// Layout: `[blob 0][blob 1]..[blob n-1][header object][4B header length LE]`.
/// Blob offsets count from the first byte of the pack, so the offset of a
/// blob equals the number of blob bytes written before it.
pub struct PackWriter<W> {
    pack_type: PackType,
    writer: W,
    entries: Vec<PackHeaderEntry>,
    data_size: u64,
    max_blob_size: u32,
    /// Set when a write failed part-way; the byte stream no longer matches
    /// `entries`.
    poisoned: bool,
}

impl<W: Write> PackWriter<W> {
    pub fn new(pack_type: PackType, writer: W) -> Self {
        Self {
            pack_type,
            writer,
            entries: Vec::new(),
            data_size: 0,
            max_blob_size: u32::MAX,
            poisoned: false,
        }
    }

    /// Reject blobs longer than `limit` bytes. Rejection leaves the writer
    /// usable.
    pub fn with_max_blob_size(mut self, limit: u32) -> Self {
        self.max_blob_size = limit;
        self
    }

    /// Append an already encrypted blob. Returns its offset within the pack.
    pub fn add_blob(&mut self, chunk_id: ChunkId, blob: &[u8]) -> Result<u64> {
        if self.poisoned {
            return Err(PackError::WriterPoisoned);
        }
        let length = u32::try_from(blob.len())
            .ok()
            .filter(|len| *len <= self.max_blob_size)
            .ok_or_else(|| PackError::BlobTooLarge {
                chunk_id: chunk_id.to_hex(),
                size: blob.len(),
                limit: self.max_blob_size,
            })?;

        if let Err(e) = self.writer.write_all(blob) {
            self.poisoned = true;
            return Err(e.into());
        }

        let offset = self.data_size;
        self.data_size += blob.len() as u64;
        self.entries.push(PackHeaderEntry {
            blob_type: self.pack_type,
            chunk_id,
            offset,
            length,
        });
        Ok(offset)
    }

    pub fn pack_type(&self) -> PackType {
        self.pack_type
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of blobs written so far.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes of blob data written so far.
    pub fn size(&self) -> u64 {
        self.data_size
    }

    pub fn entries(&self) -> &[PackHeaderEntry] {
        &self.entries
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Write the encrypted header and its length, flush, and hand back the
    /// inner writer together with the blob entries.
    pub fn finish(
        mut self,
        crypto: &dyn CryptoEngine,
    ) -> Result<(W, Vec<PackHeaderEntry>, PackSummary)> {
        if self.poisoned {
            return Err(PackError::WriterPoisoned);
        }

        let header_bytes = rmp_serde::to_vec(&self.entries)?;
        let header = pack_object(ObjectType::PackHeader, &header_bytes, crypto)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| PackError::Other("pack header exceeds 4 GiB".into()))?;

        self.writer.write_all(&header)?;
        self.writer.write_all(&header_len.to_le_bytes())?;
        self.writer.flush()?;

        let summary = PackSummary {
            blob_count: self.entries.len(),
            data_size: self.data_size,
            trailer_size: (header.len() + PACK_TRAILER_LEN_SIZE) as u64,
        };
        Ok((self.writer, self.entries, summary))
    }
}

/// Parse and decrypt the trailing header of a complete pack.
pub fn read_pack_header(pack_data: &[u8], crypto: &dyn CryptoEngine) -> Result<Vec<PackHeaderEntry>> {
    if pack_data.len() < PACK_TRAILER_LEN_SIZE {
        return Err(PackError::InvalidFormat("pack too small".into()));
    }

    let len_offset = pack_data.len() - PACK_TRAILER_LEN_SIZE;
    let header_len = u32::from_le_bytes(
        pack_data[len_offset..]
            .try_into()
            .map_err(|_| PackError::InvalidFormat("invalid pack header length field".into()))?,
    ) as usize;

    if header_len > len_offset {
        return Err(PackError::InvalidFormat("invalid pack header length".into()));
    }

    let header_start = len_offset - header_len;
    let header_bytes = unpack_object_expect(
        &pack_data[header_start..len_offset],
        ObjectType::PackHeader,
        crypto,
    )?;
    let entries: Vec<PackHeaderEntry> = rmp_serde::from_slice(&header_bytes)?;

    for entry in &entries {
        let end = entry.offset.checked_add(u64::from(entry.length));
        if end.is_none_or(|end| end > header_start as u64) {
            return Err(PackError::InvalidFormat(format!(
                "blob {} extends into pack header",
                entry.chunk_id
            )));
        }
    }
    Ok(entries)
}
