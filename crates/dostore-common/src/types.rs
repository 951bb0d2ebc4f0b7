//! Core type definitions for dostore
//!
//! This module defines the small value types shared by the storage
//! engine and its callers: normalized object keys, byte ranges, write
//! options and the opaque transaction metadata forwarded to the log.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Caller/operation identity forwarded to the transaction log.
///
/// The storage engine never interprets these entries.
pub type TxnMetadata = BTreeMap<String, String>;

/// Current wall-clock time in milliseconds
#[must_use]
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Case-insensitive object identity.
///
/// Object identifiers are compared without regard to case; every index
/// key, lock key and directory path is derived from this lowercase form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Normalize an object identifier
    #[must_use]
    pub fn new(object_id: &str) -> Self {
        Self(object_id.to_lowercase())
    }

    /// Get the normalized key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Byte range of an element read
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte to return
    pub start: u64,
    /// Maximum number of bytes to return (`None` = to the end)
    pub len: Option<u64>,
}

impl ByteRange {
    /// The whole element
    #[must_use]
    pub const fn full() -> Self {
        Self {
            start: 0,
            len: None,
        }
    }

    /// `len` bytes starting at `start`
    #[must_use]
    pub const fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            len: Some(len),
        }
    }

    /// Everything from `start` to the end
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self { start, len: None }
    }

    /// Whether this range covers the whole element
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.start == 0 && self.len.is_none()
    }

    /// Clamp the range to a payload of `size` bytes, returning the
    /// half-open `[start, end)` slice bounds.
    #[must_use]
    pub fn clamp(&self, size: usize) -> (usize, usize) {
        let start = usize::try_from(self.start).unwrap_or(usize::MAX).min(size);
        let end = match self.len {
            Some(len) => start
                .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
                .min(size),
            None => size,
        };
        (start, end)
    }
}

/// Options shared by every mutating storage operation
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// Explicit event time. `None` stamps the write with the current time.
    /// Replicated writes carry the originating timestamp so that replays
    /// converge regardless of arrival order.
    pub timestamp: Option<Timestamp>,
    /// Record the mutation in the transaction log
    pub log_txn: bool,
    /// Caller identity forwarded to the transaction log
    pub txn_metadata: TxnMetadata,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            timestamp: None,
            log_txn: true,
            txn_metadata: TxnMetadata::new(),
        }
    }
}

impl WriteOptions {
    /// Logged write stamped with the given event time
    #[must_use]
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    /// Do not record this mutation in the transaction log
    #[must_use]
    pub fn unlogged(mut self) -> Self {
        self.log_txn = false;
        self
    }

    /// Attach caller metadata for the transaction log
    #[must_use]
    pub fn with_metadata(mut self, metadata: TxnMetadata) -> Self {
        self.txn_metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_is_case_insensitive() {
        assert_eq!(ObjectKey::new("Test/ABC"), ObjectKey::new("test/abc"));
        assert_eq!(ObjectKey::new("Test/ABC").as_str(), "test/abc");
        assert_eq!(ObjectKey::new("Foo").to_string(), "foo");
    }

    #[test]
    fn test_byte_range_clamp() {
        assert_eq!(ByteRange::full().clamp(10), (0, 10));
        assert_eq!(ByteRange::new(2, 3).clamp(10), (2, 5));
        assert_eq!(ByteRange::new(8, 5).clamp(10), (8, 10));
        assert_eq!(ByteRange::starting_at(12).clamp(10), (10, 10));
        assert_eq!(ByteRange::new(0, u64::MAX).clamp(4), (0, 4));
        assert!(ByteRange::full().is_full());
        assert!(!ByteRange::starting_at(1).is_full());
    }

    #[test]
    fn test_write_options() {
        let opts = WriteOptions::default();
        assert!(opts.log_txn);
        assert!(opts.timestamp.is_none());

        let opts = WriteOptions::at(42).unlogged();
        assert_eq!(opts.timestamp, Some(42));
        assert!(!opts.log_txn);
    }

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        let b = now_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
