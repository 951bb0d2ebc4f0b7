//! Storage properties for dostore
//!
//! A storage root carries a small `storage_properties` file that fixes the
//! hashed directory layout and the file/embedded size threshold. Once a
//! root holds objects these values must not change, so the file is written
//! on first open and read back on every later open.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Name of the properties file inside a storage root
pub const PROPERTIES_FILE: &str = "storage_properties";

/// Default length of the hex-encoded hash used for directory names
pub const DEFAULT_HASH_LEN: usize = 15;

/// Default number of hex characters per directory level
pub const DEFAULT_SEGMENT_SIZE: usize = 3;

/// Default largest payload kept in the embedded element store (1 MiB)
pub const DEFAULT_MAX_DB_ELEMENT_SIZE: usize = 1024 * 1024;

/// Digest used to derive object directories
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5 (default). Only used to spread objects across directories.
    #[default]
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Length of the digest once hex encoded
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(Error::configuration(format!(
                "unsupported hash algorithm: {other}"
            ))),
        }
    }
}

/// Layout and tiering parameters persisted with a storage root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProperties {
    /// Digest used to derive object directories
    #[serde(default)]
    pub hash_alg: HashAlgorithm,
    /// Number of hex characters of the digest that are kept
    #[serde(default = "default_hash_len")]
    pub hash_len: usize,
    /// Number of hex characters per directory level
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Payloads larger than this are stored as files
    #[serde(default = "default_max_db_element_size")]
    pub max_db_element_size: usize,
}

fn default_hash_len() -> usize {
    DEFAULT_HASH_LEN
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_max_db_element_size() -> usize {
    DEFAULT_MAX_DB_ELEMENT_SIZE
}

impl Default for StorageProperties {
    fn default() -> Self {
        Self {
            hash_alg: HashAlgorithm::default(),
            hash_len: DEFAULT_HASH_LEN,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_db_element_size: DEFAULT_MAX_DB_ELEMENT_SIZE,
        }
    }
}

impl StorageProperties {
    /// Check the parameters for a usable directory layout
    pub fn validate(&self) -> Result<()> {
        if self.hash_len == 0 || self.hash_len > self.hash_alg.hex_len() {
            return Err(Error::configuration(format!(
                "invalid hash length {} for {} (must be 1..={})",
                self.hash_len,
                self.hash_alg,
                self.hash_alg.hex_len()
            )));
        }
        if self.segment_size == 0 || self.segment_size > self.hash_len {
            return Err(Error::configuration(format!(
                "invalid segment size {} (must be 1..={})",
                self.segment_size, self.hash_len
            )));
        }
        if self.max_db_element_size == 0 {
            return Err(Error::configuration(
                "max_db_element_size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Parse properties from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let props: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid storage properties: {e}")))?;
        props.validate()?;
        Ok(props)
    }

    /// Render properties as TOML text
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load the properties file of a storage root.
    ///
    /// Returns `None` when the root has no properties file yet.
    pub fn load(root: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = root.as_ref().join(PROPERTIES_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::configuration(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Write the properties file of a storage root
    pub fn save(&self, root: impl AsRef<Path>) -> Result<()> {
        let path = root.as_ref().join(PROPERTIES_FILE);
        std::fs::write(&path, self.to_toml()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let props = StorageProperties::default();
        assert_eq!(props.hash_alg, HashAlgorithm::Md5);
        assert_eq!(props.hash_len, 15);
        assert_eq!(props.segment_size, 3);
        assert_eq!(props.max_db_element_size, 1_048_576);
        props.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let props = StorageProperties::from_toml("segment_size = 4\n").unwrap();
        assert_eq!(props.segment_size, 4);
        assert_eq!(props.hash_len, DEFAULT_HASH_LEN);
        assert_eq!(props.hash_alg, HashAlgorithm::Md5);
    }

    #[test]
    fn test_invalid_segment_size() {
        let err = StorageProperties::from_toml("hash_len = 6\nsegment_size = 7\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = StorageProperties::from_toml("segment_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_hash_len_bounded_by_digest() {
        let err = StorageProperties::from_toml("hash_len = 33\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let props = StorageProperties::from_toml("hash_alg = \"sha256\"\nhash_len = 40\n").unwrap();
        assert_eq!(props.hash_alg, HashAlgorithm::Sha256);
    }

    #[test]
    fn test_hash_algorithm_parse() {
        assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!("SHA-1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        assert!(StorageProperties::load(dir.path()).unwrap().is_none());

        let props = StorageProperties {
            max_db_element_size: 1024,
            ..Default::default()
        };
        props.save(dir.path()).unwrap();

        let loaded = StorageProperties::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, props);
    }
}
