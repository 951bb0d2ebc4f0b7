//! Whole-object archive codec
//!
//! An archive is a header followed by framed entries: the object metadata
//! first, then one entry per element, then an end marker. Element bodies
//! are streamed in chunks so neither side has to hold a whole payload.
//!
//! ```text
//! header: | Magic "DOSA" 4B | Version 1B |
//! entry:  | Kind 1B | NameLen 4B | Name | (ChunkLen 4B | Chunk)* | 0u32 | CRC32C 4B |
//! end:    | Kind=3 1B |
//! ```
//!
//! The CRC covers every byte of the entry before the CRC field.

use crate::object::ObjectMetadata;
use dostore_common::{Error, Result};
use std::io::{self, Read, Write};

const ARCHIVE_MAGIC: u32 = 0x444F_5341; // "DOSA"
const ARCHIVE_VERSION: u8 = 1;
const CHUNK_SIZE: usize = 64 * 1024;
/// Upper bound on a single chunk accepted while reading
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
const MAX_NAME_LEN: usize = 64 * 1024;

/// Name of the metadata entry
pub const METADATA_ENTRY: &str = "_internal/metadata";

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Metadata = 1,
    Element = 2,
    End = 3,
}

impl EntryKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Metadata),
            2 => Some(Self::Element),
            3 => Some(Self::End),
            _ => None,
        }
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::Deserialization(msg.into())
}

/// Streaming archive encoder
pub struct ArchiveWriter<W: Write> {
    inner: W,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&ARCHIVE_MAGIC.to_le_bytes())?;
        inner.write_all(&[ARCHIVE_VERSION])?;
        Ok(Self { inner })
    }

    /// Write the metadata entry (JSON encoded)
    pub fn write_metadata(&mut self, metadata: &ObjectMetadata) -> Result<()> {
        let json =
            serde_json::to_vec(metadata).map_err(|e| Error::Serialization(e.to_string()))?;
        self.write_entry(EntryKind::Metadata, METADATA_ENTRY, &mut json.as_slice())
    }

    /// Stream one element body into the archive
    pub fn write_element(&mut self, element_id: &str, data: &mut dyn Read) -> Result<()> {
        self.write_entry(EntryKind::Element, element_id, data)
    }

    fn write_entry(&mut self, kind: EntryKind, name: &str, data: &mut dyn Read) -> Result<()> {
        let name_len = u32::try_from(name.len())
            .map_err(|_| Error::invalid_argument("entry name too long"))?;

        let mut head = Vec::with_capacity(5 + name.len());
        head.push(kind as u8);
        head.extend_from_slice(&name_len.to_le_bytes());
        head.extend_from_slice(name.as_bytes());
        let mut crc = crc32c::crc32c(&head);
        self.inner.write_all(&head)?;

        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match data.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            // n <= CHUNK_SIZE, always fits
            let len = (n as u32).to_le_bytes();
            crc = crc32c::crc32c_append(crc, &len);
            crc = crc32c::crc32c_append(crc, &chunk[..n]);
            self.inner.write_all(&len)?;
            self.inner.write_all(&chunk[..n])?;
        }

        let terminator = 0u32.to_le_bytes();
        crc = crc32c::crc32c_append(crc, &terminator);
        self.inner.write_all(&terminator)?;
        self.inner.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    /// Write the end marker and hand back the sink
    pub fn finish(mut self) -> Result<W> {
        self.inner.write_all(&[EntryKind::End as u8])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

struct OpenEntry {
    crc: u32,
    chunk_remaining: usize,
    done: bool,
}

/// Streaming archive decoder
pub struct ArchiveReader<R: Read> {
    inner: R,
    open: Option<OpenEntry>,
    finished: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut header = [0u8; 5];
        inner
            .read_exact(&mut header)
            .map_err(|e| corrupt(format!("archive header: {e}")))?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != ARCHIVE_MAGIC {
            return Err(corrupt("invalid archive magic"));
        }
        if header[4] != ARCHIVE_VERSION {
            return Err(corrupt(format!("unsupported archive version {}", header[4])));
        }
        Ok(Self {
            inner,
            open: None,
            finished: false,
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| corrupt(format!("truncated archive: {e}")))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Advance to the next entry, skipping whatever is left of the current
    /// one. Returns `None` after the end marker.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_, R>>> {
        if self.open.is_some() {
            io::copy(&mut EntryBody { archive: &mut *self }, &mut io::sink())
                .map_err(|e| corrupt(e.to_string()))?;
            self.open = None;
        }
        if self.finished {
            return Ok(None);
        }

        let mut kind = [0u8; 1];
        self.inner
            .read_exact(&mut kind)
            .map_err(|e| corrupt(format!("truncated archive: {e}")))?;
        let kind = EntryKind::from_u8(kind[0])
            .ok_or_else(|| corrupt(format!("invalid entry kind {}", kind[0])))?;
        if kind == EntryKind::End {
            self.finished = true;
            return Ok(None);
        }

        let name_len_raw = self.read_u32()?;
        let name_len = name_len_raw as usize;
        if name_len > MAX_NAME_LEN {
            return Err(corrupt(format!("entry name length {name_len} out of range")));
        }
        let mut name = vec![0u8; name_len];
        self.inner
            .read_exact(&mut name)
            .map_err(|e| corrupt(format!("truncated entry name: {e}")))?;

        let mut crc = crc32c::crc32c(&[kind as u8]);
        crc = crc32c::crc32c_append(crc, &name_len_raw.to_le_bytes());
        crc = crc32c::crc32c_append(crc, &name);
        let name = String::from_utf8(name).map_err(|_| corrupt("entry name is not UTF-8"))?;

        self.open = Some(OpenEntry {
            crc,
            chunk_remaining: 0,
            done: false,
        });
        Ok(Some(ArchiveEntry {
            kind,
            name,
            body: EntryBody { archive: self },
        }))
    }

    /// Read the metadata entry that must open every archive
    pub fn read_metadata(&mut self) -> Result<ObjectMetadata> {
        let Some(mut entry) = self.next_entry()? else {
            return Err(corrupt("archive has no metadata entry"));
        };
        if entry.kind != EntryKind::Metadata {
            return Err(corrupt(format!("expected metadata entry, found '{}'", entry.name)));
        }
        let mut json = Vec::new();
        entry
            .read_to_end(&mut json)
            .map_err(|e| corrupt(format!("metadata entry: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| corrupt(format!("metadata entry: {e}")))
    }

    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
        let Some(state) = self.open.as_ref() else {
            return Ok(0);
        };
        if state.done || buf.is_empty() {
            return Ok(0);
        }

        if state.chunk_remaining == 0 {
            let mut len = [0u8; 4];
            self.inner.read_exact(&mut len)?;
            let chunk_len = u32::from_le_bytes(len) as usize;
            let Some(state) = self.open.as_mut() else {
                return Ok(0);
            };
            state.crc = crc32c::crc32c_append(state.crc, &len);
            if chunk_len == 0 {
                let mut stored = [0u8; 4];
                self.inner.read_exact(&mut stored)?;
                let stored = u32::from_le_bytes(stored);
                state.done = true;
                if stored != state.crc {
                    return Err(invalid(format!(
                        "entry checksum mismatch: stored {stored:08x}, computed {:08x}",
                        state.crc
                    )));
                }
                return Ok(0);
            }
            if chunk_len > MAX_CHUNK_SIZE {
                return Err(invalid(format!("chunk length {chunk_len} out of range")));
            }
            state.chunk_remaining = chunk_len;
        }

        let Some(state) = self.open.as_mut() else {
            return Ok(0);
        };
        let want = buf.len().min(state.chunk_remaining);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive ended inside an entry",
            ));
        }
        state.crc = crc32c::crc32c_append(state.crc, &buf[..n]);
        state.chunk_remaining -= n;
        Ok(n)
    }
}

struct EntryBody<'a, R: Read> {
    archive: &'a mut ArchiveReader<R>,
}

impl<R: Read> Read for EntryBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.archive.read_body(buf)
    }
}

/// One decoded entry. Its body is verified against the entry checksum
/// when fully read; a mismatch surfaces as an `InvalidData` read error.
pub struct ArchiveEntry<'a, R: Read> {
    pub kind: EntryKind,
    pub name: String,
    body: EntryBody<'a, R>,
}

impl<R: Read> Read for ArchiveEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn sample_metadata() -> ObjectMetadata {
        let mut md = ObjectMetadata::new("Obj/1");
        md.date_created = 100;
        md.apply_attribute(None, "title", Some("hello"), 100);
        md
    }

    fn build(elements: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut w = ArchiveWriter::new(Vec::new()).unwrap();
        w.write_metadata(&sample_metadata()).unwrap();
        for (name, data) in elements {
            w.write_element(name, &mut data.as_slice()).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn test_archive_entries_in_order() {
        let mut big = vec![0u8; CHUNK_SIZE * 2 + 17];
        rand::thread_rng().fill_bytes(&mut big);
        let bytes = build(&[("small", b"abc".to_vec()), ("big", big.clone()), ("empty", vec![])]);

        let mut r = ArchiveReader::new(bytes.as_slice()).unwrap();
        assert_eq!(r.read_metadata().unwrap(), sample_metadata());

        let mut seen = Vec::new();
        while let Some(mut entry) = r.next_entry().unwrap() {
            assert_eq!(entry.kind, EntryKind::Element);
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            seen.push((entry.name.clone(), data));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("small".to_string(), b"abc".to_vec()));
        assert_eq!(seen[1].1, big);
        assert!(seen[2].1.is_empty());
        assert!(r.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_unread_entries_are_skipped() {
        let bytes = build(&[("a", vec![1; 1000]), ("b", vec![2; 10])]);
        let mut r = ArchiveReader::new(bytes.as_slice()).unwrap();
        r.read_metadata().unwrap();

        let first = r.next_entry().unwrap().unwrap();
        assert_eq!(first.name, "a");
        let mut second = r.next_entry().unwrap().unwrap();
        assert_eq!(second.name, "b");
        let mut data = Vec::new();
        second.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![2; 10]);
    }

    #[test]
    fn test_corrupted_payload_is_detected() {
        let mut bytes = build(&[("el", vec![5; 100])]);
        // flip a byte inside the element body (past header + metadata entry)
        let pos = bytes.len() - 30;
        bytes[pos] ^= 0xFF;

        let mut r = ArchiveReader::new(bytes.as_slice()).unwrap();
        r.read_metadata().unwrap();
        let mut entry = r.next_entry().unwrap().unwrap();
        let err = entry.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_bad_header_and_truncation() {
        assert!(matches!(
            ArchiveReader::new(&b"NOPE!"[..]),
            Err(Error::Deserialization(_))
        ));

        let bytes = build(&[("el", vec![5; 100])]);
        let truncated = &bytes[..bytes.len() - 20];
        let mut r = ArchiveReader::new(truncated).unwrap();
        r.read_metadata().unwrap();
        let mut entry = r.next_entry().unwrap().unwrap();
        assert!(entry.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_missing_metadata_entry() {
        let mut w = ArchiveWriter::new(Vec::new()).unwrap();
        w.write_element("el", &mut &b"x"[..]).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = ArchiveReader::new(bytes.as_slice()).unwrap();
        assert!(matches!(r.read_metadata(), Err(Error::Deserialization(_))));
    }
}
