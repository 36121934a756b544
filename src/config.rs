//! Configuration for bunchsync.
//!
//! Resolution order: CLI flags → config file → defaults.

use crate::error::{Result, TransferError};
use crate::streaming::packer::{PackerConfig, DEFAULT_BUNCH_SIZE, DEFAULT_LEVEL};
use crate::streaming::unpacker::DEFAULT_QUOTA;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pack: PackConfig,
    pub unpack: UnpackConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Compressed bytes per bunch.
    pub bunch_size: usize,
    /// zstd level, 1..=22.
    pub level: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackConfig {
    /// Content bytes one transfer may write. 0 rejects every non-empty file.
    pub quota: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            bunch_size: DEFAULT_BUNCH_SIZE,
            level: DEFAULT_LEVEL,
        }
    }
}

impl Default for UnpackConfig {
    fn default() -> Self {
        Self {
            quota: DEFAULT_QUOTA,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pack.bunch_size == 0 {
            return Err(TransferError::Config(
                "pack.bunch_size must be at least 1".into(),
            ));
        }
        if u32::try_from(self.pack.bunch_size).is_err() {
            return Err(TransferError::Config(format!(
                "pack.bunch_size {} exceeds the 32-bit length field",
                self.pack.bunch_size
            )));
        }
        if !(1..=22).contains(&self.pack.level) {
            return Err(TransferError::Config(format!(
                "pack.level {} is outside 1..=22",
                self.pack.level
            )));
        }
        Ok(())
    }

    pub fn packer_config(&self) -> PackerConfig {
        PackerConfig {
            bunch_size: self.pack.bunch_size,
            level: self.pack.level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pack.bunch_size, 1024);
        assert_eq!(config.pack.level, 3);
        assert_eq!(config.unpack.quota, 2 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str("[unpack]\nquota = 4096\n").unwrap();
        assert_eq!(config.unpack.quota, 4096);
        assert_eq!(config.pack, PackConfig::default());
    }

    #[test]
    fn test_rejects_zero_bunch_size() {
        let err = Config::from_toml_str("[pack]\nbunch_size = 0\n").unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_level() {
        assert!(Config::from_toml_str("[pack]\nlevel = 0\n").is_err());
        assert!(Config::from_toml_str("[pack]\nlevel = 23\n").is_err());
        assert!(Config::from_toml_str("[pack]\nlevel = 19\n").is_ok());
    }

    #[test]
    fn test_load_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bunchsync.toml");
        std::fs::write(&path, "[pack]\nbunch_size = 512\nlevel = 9\n").unwrap();

        let config = Config::load(&path).unwrap();
        let packer = config.packer_config();
        assert_eq!(packer.bunch_size, 512);
        assert_eq!(packer.level, 9);

        let missing = Config::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, TransferError::Io { .. }));
    }

    #[test]
    fn test_serialized_defaults_parse_back() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), Config::default());
    }
}
