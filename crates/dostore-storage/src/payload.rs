//! Element payload I/O
//!
//! File-backed payloads live at `<object dir>/<escaped element id>`.
//! This module holds the file side of the two backends plus the stream
//! handed to readers; the tiering decisions themselves are made by the
//! engine, which owns both backends and the metadata.

use crate::hashdir::convert_from_file_name;
use crate::locks::ReadGuard;
use dostore_common::ByteRange;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COPY_BUF_SIZE: usize = 8192;

/// An element file found in an object directory
#[derive(Debug, Clone)]
pub struct ElementFile {
    pub element_id: String,
    pub path: PathBuf,
    pub len: u64,
}

/// Read from `input` into `buf` until EOF or until `buf` holds more than
/// `limit` bytes. Returns `true` when the limit was exceeded, in which
/// case `input` may still have unread data.
pub fn fill_up_to(buf: &mut Vec<u8>, input: &mut dyn Read, limit: usize) -> io::Result<bool> {
    let mut chunk = [0u8; COPY_BUF_SIZE];
    while buf.len() <= limit {
        let n = match input.read(&mut chunk) {
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// Write `head` followed by the rest of `input` to `path`, creating parent
/// directories as needed. Returns the final length of the file.
///
/// On failure a freshly created (non-append) file is removed again.
pub fn write_file(path: &Path, head: &[u8], input: &mut dyn Read, append: bool) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = (|| {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        file.write_all(head)?;
        io::copy(input, &mut file)?;
        file.sync_data()?;
        file.metadata().map(|m| m.len())
    })();
    if result.is_err() && !append {
        let _ = fs::remove_file(path);
    }
    result
}

/// Whole contents of an element file; a missing file reads as empty
pub fn read_file(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Length of an element file; a missing file has length zero
pub fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Remove an element file if present
pub fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Enumerate element files in an object directory.
///
/// A missing directory yields nothing. Names that do not decode as
/// element IDs are skipped with a warning.
pub fn list_element_files(dir: &Path) -> io::Result<Vec<ElementFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(element_id) = name.to_str().and_then(convert_from_file_name) else {
            if name != ".DS_Store" {
                warn!("Ignoring unrecognized file {:?} in {:?}", name, dir);
            }
            continue;
        };
        files.push(ElementFile {
            element_id,
            path: entry.path(),
            len: meta.len(),
        });
    }
    files.sort_by(|a, b| a.element_id.cmp(&b.element_id));
    Ok(files)
}

enum Source {
    Memory(Cursor<Vec<u8>>),
    File(io::Take<BufReader<File>>),
}

/// Byte stream over one element.
///
/// File-backed readers keep the element's read lock until the stream hits
/// end-of-data, [`ElementReader::close`] is called, or the reader is
/// dropped, whichever comes first. Embedded payloads are copied out at
/// open time and hold no lock.
pub struct ElementReader {
    source: Source,
    guard: Option<ReadGuard>,
}

impl ElementReader {
    /// Reader over an in-memory slice of an embedded payload
    pub(crate) fn embedded(mut data: Vec<u8>, range: ByteRange) -> Self {
        let (start, end) = range.clamp(data.len());
        if start > 0 || end < data.len() {
            data.truncate(end);
            data.drain(..start);
        }
        Self {
            source: Source::Memory(Cursor::new(data)),
            guard: None,
        }
    }

    /// Reader over a range of an element file. A missing file reads as
    /// empty (and releases the lock immediately).
    pub(crate) fn file(path: &Path, range: ByteRange, guard: ReadGuard) -> io::Result<Self> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Element file {:?} vanished; reading as empty", path);
                return Ok(Self::embedded(Vec::new(), range));
            }
            Err(e) => return Err(e),
        };
        if range.start > 0 {
            file.seek(SeekFrom::Start(range.start))?;
        }
        let limit = range.len.unwrap_or(u64::MAX);
        Ok(Self {
            source: Source::File(BufReader::new(file).take(limit)),
            guard: Some(guard),
        })
    }

    /// Release the read lock (if any). Further reads still drain whatever
    /// the stream already has open.
    pub fn close(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
        }
    }

    /// Whether this reader still holds the element's read lock
    #[must_use]
    pub fn holds_lock(&self) -> bool {
        self.guard.as_ref().is_some_and(ReadGuard::is_held)
    }

    /// Drain the stream into a vector
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for ElementReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.source {
            Source::Memory(cursor) => cursor.read(buf)?,
            Source::File(file) => file.read(buf)?,
        };
        if n == 0 && !buf.is_empty() {
            self.close();
        }
        Ok(n)
    }
}

impl std::fmt::Debug for ElementReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Memory(_) => "embedded",
            Source::File(_) => "file",
        };
        f.debug_struct("ElementReader")
            .field("source", &kind)
            .field("locked", &self.holds_lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashdir::convert_to_file_name;
    use crate::locks::ElementLocks;
    use tempfile::tempdir;

    #[test]
    fn test_fill_up_to() {
        let data = vec![7u8; 100];

        let mut buf = Vec::new();
        assert!(!fill_up_to(&mut buf, &mut data.as_slice(), 100).unwrap());
        assert_eq!(buf.len(), 100);

        let mut buf = Vec::new();
        let mut input = data.as_slice();
        assert!(fill_up_to(&mut buf, &mut input, 50).unwrap());
        assert!(buf.len() > 50);
        assert_eq!(buf.len() + input.len(), 100);
    }

    #[test]
    fn test_write_and_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/el");

        let n = write_file(&path, b"head-", &mut &b"body"[..], false).unwrap();
        assert_eq!(n, 9);
        let n = write_file(&path, b"", &mut &b"+more"[..], true).unwrap();
        assert_eq!(n, 14);
        assert_eq!(read_file(&path).unwrap(), b"head-body+more");

        let n = write_file(&path, b"", &mut &b"new"[..], false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(file_len(&path).unwrap(), 3);

        assert!(remove_file(&path).unwrap());
        assert!(!remove_file(&path).unwrap());
        assert!(read_file(&path).unwrap().is_empty());
    }

    #[test]
    fn test_list_element_files() {
        let dir = tempdir().unwrap();
        assert!(list_element_files(&dir.path().join("missing")).unwrap().is_empty());

        fs::write(dir.path().join(convert_to_file_name("a/b")), b"12").unwrap();
        fs::write(dir.path().join(convert_to_file_name("c")), b"345").unwrap();
        fs::write(dir.path().join("bad."), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let files = list_element_files(dir.path()).unwrap();
        let ids: Vec<_> = files.iter().map(|f| f.element_id.as_str()).collect();
        assert_eq!(ids, vec!["a/b", "c"]);
        assert_eq!(files[1].len, 3);
    }

    #[test]
    fn test_embedded_reader_ranges() {
        let data: Vec<u8> = (0..10).collect();
        let r = ElementReader::embedded(data.clone(), ByteRange::new(2, 3));
        assert!(!r.holds_lock());
        assert_eq!(r.into_bytes().unwrap(), vec![2, 3, 4]);

        let r = ElementReader::embedded(data.clone(), ByteRange::starting_at(20));
        assert!(r.into_bytes().unwrap().is_empty());

        let r = ElementReader::embedded(data.clone(), ByteRange::full());
        assert_eq!(r.into_bytes().unwrap(), data);
    }

    #[test]
    fn test_file_reader_releases_lock_at_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("el");
        fs::write(&path, b"0123456789").unwrap();

        let locks = ElementLocks::new();
        let mut r =
            ElementReader::file(&path, ByteRange::new(3, 4), locks.read("el$o".into())).unwrap();
        assert!(r.holds_lock());
        assert_eq!(locks.len(), 1);

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"3456");
        assert!(!r.holds_lock());
        assert!(locks.is_empty());

        // close after EOF is a no-op
        r.close();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_file_reader_releases_lock_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("el");
        fs::write(&path, vec![1u8; 100_000]).unwrap();

        let locks = ElementLocks::new();
        let mut r = ElementReader::file(&path, ByteRange::full(), locks.read("k".into())).unwrap();
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(locks.len(), 1);
        drop(r);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let locks = ElementLocks::new();
        let r = ElementReader::file(&dir.path().join("gone"), ByteRange::full(), locks.read("k".into()))
            .unwrap();
        assert!(locks.is_empty());
        assert!(r.into_bytes().unwrap().is_empty());
    }
}
