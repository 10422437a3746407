use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackError>;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("creating temporary pack file: {source}")]
    TempFile {
        #[source]
        source: std::io::Error,
    },

    #[error("finalizing pack (temp file kept at '{}'): {source}", path.display())]
    Finalize {
        path: PathBuf,
        #[source]
        source: Box<PackError>,
    },

    #[error("saving pack {pack_id}: {source}")]
    Upload {
        pack_id: String,
        #[source]
        source: Box<PackError>,
    },

    #[error("removing temp file '{}' of saved pack {pack_id}: {source}", path.display())]
    TempCleanup {
        pack_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `pack_id` names the pack whose save triggered the flush. The pack
    /// itself is stored and indexed in memory.
    #[error("flushing index{}: {source}", after_pack(pack_id))]
    IndexFlush {
        pack_id: Option<String>,
        #[source]
        source: Box<PackError>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity digest mismatch for '{0}'")]
    HashMismatch(String),

    #[error("blob {chunk_id} is {size} bytes, limit is {limit}")]
    BlobTooLarge {
        chunk_id: String,
        size: usize,
        limit: u32,
    },

    #[error("pack writer failed earlier and cannot accept more data")]
    WriterPoisoned,

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Whether the error leaves the operation incomplete.
    ///
    /// Only [`PackError::TempCleanup`] is non-fatal: the pack it refers to is
    /// already stored and indexed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PackError::TempCleanup { .. })
    }

    /// Whether the error (or the error it wraps) is a cancellation.
    pub fn is_interrupted(&self) -> bool {
        match self {
            PackError::Interrupted => true,
            PackError::Upload { source, .. } | PackError::Finalize { source, .. } => {
                source.is_interrupted()
            }
            _ => false,
        }
    }
}

fn after_pack(pack_id: &Option<String>) -> String {
    pack_id
        .as_deref()
        .map(|id| format!(" after saving pack {id}"))
        .unwrap_or_default()
}
