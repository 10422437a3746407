use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use blake2::digest::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::error::{PackError, Result};
use crate::hashing::{BackendHasher, HashingWriter};
use crate::storage::{Handle, RewindReader, StorageBackend};

/// Storage backend for a local filesystem directory.
pub struct LocalBackend {
    root: PathBuf,
    verify_sha256: bool,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &Path) -> Result<Self> {
        // Canonicalize if the path already exists for clearer errors and
        // correct strip_prefix behavior with symlinked roots.
        let root = if root.exists() {
            fs::canonicalize(root)?
        } else {
            root.to_path_buf()
        };
        Ok(Self {
            root,
            verify_sha256: false,
        })
    }

    /// Ask uploaders for a SHA-256 of every saved object and reject uploads
    /// whose bytes do not match it.
    pub fn with_integrity_check(mut self) -> Self {
        self.verify_sha256 = true;
        self
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(PackError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(PackError::InvalidFormat(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(PackError::InvalidFormat(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Open a temp file next to `path`, creating the parent directory on demand.
    fn temp_file_for(&self, path: &Path) -> Result<tempfile::NamedTempFile> {
        let dir = path.parent().unwrap_or(&self.root);
        match tempfile::NamedTempFile::new_in(dir) {
            Ok(tmp) => Ok(tmp),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                Ok(tempfile::NamedTempFile::new_in(dir)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Written to a temp file in the same directory, then renamed into place,
    /// so readers never see a partial object.
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let mut tmp = self.temp_file_for(&path)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)?;
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Streams the upload to disk instead of buffering it.
    fn save(&self, handle: &Handle, reader: &mut dyn RewindReader) -> Result<()> {
        let key = handle.storage_key();
        let path = self.resolve(&key)?;
        reader.rewind()?;

        let mut out = HashingWriter::new(self.temp_file_for(&path)?, Sha256::new());
        let copied = io::copy(reader, &mut out)?;
        if copied != reader.length() {
            return Err(PackError::Storage(format!(
                "{key}: read {copied} bytes, expected {}",
                reader.length()
            )));
        }
        if self.verify_sha256 {
            let expected = reader
                .hash()
                .ok_or_else(|| PackError::Storage(format!("{key}: missing SHA-256 digest")))?;
            if out.sum() != expected {
                return Err(PackError::HashMismatch(key));
            }
        }

        let tmp = out.into_inner();
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(key = %key, bytes = copied, "stored object");
        Ok(())
    }

    fn hasher(&self) -> Option<BackendHasher> {
        if self.verify_sha256 {
            Some(Box::new(Sha256::new()))
        } else {
            None
        }
    }
}
