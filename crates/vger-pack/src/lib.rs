//! Pack assembly for vger repositories.
//!
//! Blobs are appended to pooled [`Packer`](repo::packer::Packer)s backed by
//! temp files, then uploaded as content-addressed packs and recorded in the
//! index.

pub mod config;
pub mod crypto;
pub mod error;
pub mod hashing;
pub mod index;
pub mod repo;
pub mod storage;

#[cfg(test)]
mod testutil;
