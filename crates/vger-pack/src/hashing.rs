//! Writers that hash everything passing through them.

use std::io::{self, Write};

use blake2::digest::{Digest, DynDigest};
use sha2::Sha256;

use crate::crypto::pack_id::Blake2b256;

/// Digest algorithm a storage backend asks for in addition to the pack's
/// content hash (e.g. a SHA-256 the remote side verifies on upload).
pub type BackendHasher = Box<dyn DynDigest + Send>;

/// An incrementally updated hash whose current value can be read at any time.
pub trait RunningDigest: Send {
    fn update(&mut self, data: &[u8]);

    /// Digest of everything seen so far. Does not reset the state.
    fn sum(&self) -> Vec<u8>;
}

impl RunningDigest for Blake2b256 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn sum(&self) -> Vec<u8> {
        self.clone().finalize().to_vec()
    }
}

impl RunningDigest for Sha256 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn sum(&self) -> Vec<u8> {
        self.clone().finalize().to_vec()
    }
}

impl RunningDigest for BackendHasher {
    fn update(&mut self, data: &[u8]) {
        DynDigest::update(&mut **self, data);
    }

    fn sum(&self) -> Vec<u8> {
        self.box_clone().finalize().into_vec()
    }
}

/// Wraps a writer and feeds every byte it accepts into a digest.
///
/// Only the bytes the inner writer reports as written are hashed, so the digest
/// always matches what reached the inner writer.
pub struct HashingWriter<W, H> {
    inner: W,
    hasher: H,
    bytes_written: u64,
}

impl<W: Write, H: RunningDigest> HashingWriter<W, H> {
    pub fn new(inner: W, hasher: H) -> Self {
        Self {
            inner,
            hasher,
            bytes_written: 0,
        }
    }

    pub fn sum(&self) -> Vec<u8> {
        self.hasher.sum()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write, H: RunningDigest> Write for HashingWriter<W, H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
