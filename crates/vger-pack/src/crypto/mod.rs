pub mod aes_gcm;
pub mod chunk_id;
pub mod pack_id;

use crate::error::Result;

/// Seals pack headers and index files before they reach storage.
///
/// Blob payloads arrive already encrypted and never pass through here.
pub trait CryptoEngine: Send + Sync {
    /// The result must round-trip through [`CryptoEngine::decrypt`] with the
    /// same `aad`.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;
}

/// Identity engine. Objects are stored as-is and `aad` is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
