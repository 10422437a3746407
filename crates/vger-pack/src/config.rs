use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};

/// Default size threshold at which an open pack is finalized and uploaded.
pub const DEFAULT_MIN_PACK_SIZE: u32 = 4 * 1024 * 1024;

/// Packs larger than this are rejected by [`PackerConfig::validate`].
pub const MAX_PACK_SIZE_LIMIT: u32 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Callers finalize a packer once `size() >= min_pack_size`.
    #[serde(default = "default_min_pack_size")]
    pub min_pack_size: u32,
    /// Longest single blob a packer accepts.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u32,
    /// Directory for in-progress pack files. `None` uses the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Flush the index after every saved pack. Disable to batch index writes
    /// and call `Repository::flush` explicitly.
    #[serde(default = "default_auto_index_flush")]
    pub auto_index_flush: bool,
    /// Pending index entries are written once this many blobs accumulate.
    #[serde(default = "default_index_full_entries")]
    pub index_full_entries: usize,
    /// ...or once the oldest pending entry is this old.
    #[serde(default = "default_index_max_age_secs")]
    pub index_max_age_secs: u64,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            min_pack_size: default_min_pack_size(),
            max_blob_size: default_max_blob_size(),
            temp_dir: None,
            auto_index_flush: default_auto_index_flush(),
            index_full_entries: default_index_full_entries(),
            index_max_age_secs: default_index_max_age_secs(),
        }
    }
}

impl PackerConfig {
    pub fn index_max_age(&self) -> Duration {
        Duration::from_secs(self.index_max_age_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_pack_size == 0 {
            return Err(PackError::Config("min_pack_size must be greater than 0".into()));
        }
        if self.min_pack_size > MAX_PACK_SIZE_LIMIT {
            return Err(PackError::Config(format!(
                "min_pack_size ({}) exceeds hard limit of 512 MiB",
                self.min_pack_size
            )));
        }
        if self.max_blob_size == 0 {
            return Err(PackError::Config("max_blob_size must be greater than 0".into()));
        }
        if self.index_full_entries == 0 {
            return Err(PackError::Config(
                "index_full_entries must be greater than 0".into(),
            ));
        }
        if let Some(dir) = &self.temp_dir {
            if !dir.is_dir() {
                return Err(PackError::Config(format!(
                    "temp_dir '{}' is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn default_min_pack_size() -> u32 {
    DEFAULT_MIN_PACK_SIZE
}

fn default_max_blob_size() -> u32 {
    u32::MAX
}

fn default_auto_index_flush() -> bool {
    true
}

fn default_index_full_entries() -> usize {
    50_000
}

fn default_index_max_age_secs() -> u64 {
    10 * 60
}

/// Load and validate a packer configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<PackerConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PackError::Config(format!("cannot read '{}': {e}", path.display()))
    })?;
    parse_config(&contents)
        .map_err(|e| PackError::Config(format!("{}: {e}", path.display())))
}

/// Parse and validate a packer configuration from a YAML string.
pub fn parse_config(yaml: &str) -> Result<PackerConfig> {
    let config: PackerConfig = serde_yaml::from_str(yaml)
        .map_err(|e| PackError::Config(format!("invalid config: {e}")))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg = parse_config("{}").unwrap();
        assert_eq!(cfg.min_pack_size, 4 * 1024 * 1024);
        assert!(cfg.auto_index_flush);
        assert_eq!(cfg.index_full_entries, 50_000);
        assert_eq!(cfg.index_max_age(), Duration::from_secs(600));
        assert!(cfg.temp_dir.is_none());
        assert_eq!(cfg.max_blob_size, u32::MAX);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = parse_config("min_pack_size: 1048576\nauto_index_flush: false\n").unwrap();
        assert_eq!(cfg.min_pack_size, 1024 * 1024);
        assert!(!cfg.auto_index_flush);
    }

    #[test]
    fn rejects_zero_pack_size() {
        let err = parse_config("min_pack_size: 0").unwrap_err();
        assert!(matches!(err, PackError::Config(_)));
    }

    #[test]
    fn rejects_zero_blob_size() {
        let err = parse_config("max_blob_size: 0").unwrap_err();
        assert!(err.to_string().contains("max_blob_size"));
    }

    #[test]
    fn rejects_oversized_pack_size() {
        let err = parse_config("min_pack_size: 1073741824").unwrap_err();
        assert!(err.to_string().contains("512 MiB"));
    }

    #[test]
    fn rejects_missing_temp_dir() {
        let cfg = PackerConfig {
            temp_dir: Some(PathBuf::from("/nonexistent/vger-pack-temp")),
            ..PackerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packer.yaml");
        std::fs::write(&path, "index_full_entries: 10\nindex_max_age_secs: 5\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.index_full_entries, 10);
        assert_eq!(cfg.index_max_age_secs, 5);
    }
}
