//! Hashed directory layout
//!
//! Objects are spread over a directory tree derived from a digest of the
//! lowercased object ID so that no single directory grows past
//! `16^segment_size` entries:
//!
//! ```text
//! <root>/9F8/2C1/04A/B77/E03/<escaped object id>/<escaped element id>
//!        \__________ hash_len hex chars ________/
//! ```
//!
//! Object and element IDs become file names through a reversible escape:
//! ASCII alphanumerics, `_` and `-` pass through, every other UTF-8 byte
//! becomes `.` followed by two uppercase hex digits. Since `.` and `/` are
//! always escaped, no ID can produce `..` or a separator in a path.

use dostore_common::{HashAlgorithm, ObjectKey, StorageProperties};
use sha2::Digest as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Maps object IDs to their directory inside a storage root
#[derive(Clone, Debug)]
pub struct PathHasher {
    hash_alg: HashAlgorithm,
    hash_len: usize,
    segment_size: usize,
}

impl PathHasher {
    /// Build a hasher from validated storage properties
    #[must_use]
    pub fn new(props: &StorageProperties) -> Self {
        Self {
            hash_alg: props.hash_alg,
            hash_len: props.hash_len,
            segment_size: props.segment_size,
        }
    }

    /// Uppercase hex digest of the normalized object ID, cut to `hash_len`
    fn hashed_prefix(&self, key: &ObjectKey) -> String {
        let bytes = key.as_str().as_bytes();
        let mut hex = match self.hash_alg {
            HashAlgorithm::Md5 => hex::encode_upper(md5::compute(bytes).0),
            HashAlgorithm::Sha1 => hex::encode_upper(sha1::Sha1::digest(bytes)),
            HashAlgorithm::Sha256 => hex::encode_upper(sha2::Sha256::digest(bytes)),
        };
        hex.truncate(self.hash_len);
        hex
    }

    /// Path of an object's directory relative to the storage root
    #[must_use]
    pub fn object_path(&self, object_id: &str) -> PathBuf {
        let key = ObjectKey::new(object_id);
        let hex = self.hashed_prefix(&key);

        let mut path = PathBuf::new();
        let mut rest = hex.as_str();
        while !rest.is_empty() {
            let cut = rest.len().min(self.segment_size);
            let (segment, tail) = rest.split_at(cut);
            path.push(segment);
            rest = tail;
        }
        path.push(convert_to_file_name(key.as_str()));
        path
    }
}

/// Encode an arbitrary identifier as a portable file name
#[must_use]
pub fn convert_to_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 10);
    for &b in id.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(char::from(b));
        } else {
            out.push('.');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

/// Decode a file name produced by [`convert_to_file_name`].
///
/// Returns `None` for names that are not valid encodings.
#[must_use]
pub fn convert_from_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            let pair = bytes.get(i + 1..i + 3)?;
            let decoded = hex::decode(pair).ok()?;
            out.push(decoded[0]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Remove `dir` and then each parent that has become empty, stopping at
/// (and never removing) `root`.
///
/// Stray `.DS_Store` files do not keep a directory alive.
pub fn remove_empty_dirs_from(root: &Path, dir: &Path) {
    let mut current = dir.to_path_buf();
    while current.starts_with(root) && current != root {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !current.pop() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!("Failed to scan {:?} during cleanup: {}", current, e);
                break;
            }
        };

        let mut live = 0usize;
        for entry in entries.flatten() {
            if entry.file_name() == ".DS_Store" {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            live += 1;
        }
        if live > 0 {
            break;
        }

        if let Err(e) = fs::remove_dir(&current) {
            debug!("Stopped pruning at {:?}: {}", current, e);
            break;
        }
        if !current.pop() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hasher() -> PathHasher {
        PathHasher::new(&StorageProperties::default())
    }

    #[test]
    fn test_path_is_deterministic_and_case_insensitive() {
        let h = hasher();
        for id in ["20.500/ABC", "Object-1", "ÜnïcødeID", "a b c"] {
            assert_eq!(h.object_path(id), h.object_path(id));
            assert_eq!(h.object_path(id), h.object_path(&id.to_lowercase()));
        }
        assert_ne!(h.object_path("one"), h.object_path("two"));
    }

    #[test]
    fn test_path_segments() {
        let h = hasher();
        let path = h.object_path("test/1");
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        // 15 hex chars in segments of 3, then the escaped id
        assert_eq!(parts.len(), 6);
        for segment in &parts[..5] {
            assert_eq!(segment.len(), 3);
            assert!(segment.chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_eq!(parts[5], "test.2F1");

        let expected = hex::encode_upper(md5::compute(b"test/1").0);
        assert_eq!(parts[..5].concat(), expected[..15]);
    }

    #[test]
    fn test_uneven_last_segment() {
        let props = StorageProperties {
            hash_len: 8,
            segment_size: 3,
            ..Default::default()
        };
        let h = PathHasher::new(&props);
        let path = h.object_path("x");
        let lens: Vec<usize> = path
            .components()
            .map(|c| c.as_os_str().len())
            .collect();
        assert_eq!(lens, vec![3, 3, 2, 1]);
    }

    #[test]
    fn test_file_name_escape() {
        assert_eq!(convert_to_file_name("abc_XYZ-09"), "abc_XYZ-09");
        assert_eq!(convert_to_file_name("a.b"), "a.2Eb");
        assert_eq!(convert_to_file_name("é"), ".C3.A9");

        for id in ["plain", "with/slash", "20.500.123/xyz", "ünïcødé", "%.%", ""] {
            let name = convert_to_file_name(id);
            assert_eq!(convert_from_file_name(&name).as_deref(), Some(id));
        }
    }

    #[test]
    fn test_traversal_is_neutralized() {
        for hostile in ["..", "../../etc/passwd", "/abs", "a/../b"] {
            let name = convert_to_file_name(hostile);
            assert!(!name.contains('/'));
            assert!(!name.contains(".."));
            assert_ne!(name, ".");

            let path = hasher().object_path(hostile);
            assert!(path.components().all(|c| matches!(c, std::path::Component::Normal(_))));
        }
    }

    #[test]
    fn test_malformed_file_names() {
        assert!(convert_from_file_name("abc.").is_none());
        assert!(convert_from_file_name("abc.Z1").is_none());
        assert!(convert_from_file_name(".FF").is_none()); // not UTF-8
    }

    #[test]
    fn test_remove_empty_dirs_stops_at_root() {
        let root = tempdir().unwrap();
        let leaf = root.path().join("aaa/bbb/ccc");
        fs::create_dir_all(&leaf).unwrap();
        fs::create_dir_all(root.path().join("aaa/keep")).unwrap();

        remove_empty_dirs_from(root.path(), &leaf);

        assert!(!root.path().join("aaa/bbb").exists());
        assert!(root.path().join("aaa/keep").exists());

        remove_empty_dirs_from(root.path(), &root.path().join("aaa/keep"));
        assert!(!root.path().join("aaa").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_remove_empty_dirs_ignores_ds_store() {
        let root = tempdir().unwrap();
        let leaf = root.path().join("x/y");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(leaf.join(".DS_Store"), b"junk").unwrap();

        remove_empty_dirs_from(root.path(), &leaf);
        assert!(!root.path().join("x").exists());
    }
}
