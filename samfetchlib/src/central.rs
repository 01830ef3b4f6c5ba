//! Central directory of a zip archive that was read front to back.
//!
//! A streaming reader only ever sees the local headers, so nothing vouches for
//! the names and sizes it extracted. The central directory and the end record
//! that trail the entries are parsed here and must describe exactly the
//! entries that were found in the stream.

use std::collections::BTreeMap;

use thiserror::Error;

const CENTRAL_HEADER_SIGNATURE: u32 = 0x02014b50;
const END_RECORD_SIGNATURE: u32 = 0x06054b50;
const ZIP64_END_RECORD_SIGNATURE: u32 = 0x06064b50;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x07064b50;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Signature bytes of a central directory header
pub(crate) const CENTRAL_HEADER_MAGIC: [u8; 4] = CENTRAL_HEADER_SIGNATURE.to_le_bytes();

#[derive(Debug, Error)]
pub(crate) enum DirectoryError {
    #[error("Central directory ends inside the {0}")]
    Truncated(&'static str),
    #[error("Expected {0} signature")]
    BadSignature(&'static str),
    #[error("Central directory entry {name:?} at offset {offset} has no local entry")]
    UnknownEntry {
        name: String,
        offset: u64,
    },
    #[error("Central directory entry {name:?} does not match the local entry {local:?}")]
    EntryMismatch {
        name: String,
        local: String,
    },
    #[error("Entry {0:?} needs zip64 fields, but has none")]
    MissingZip64(String),
    #[error("Archive spans multiple disks")]
    MultiDisk,
    #[error("End record lists {listed} entries, but {found} were found")]
    EntryCount {
        listed: u64,
        found: u64,
    },
    #[error("End record places the central directory at {listed_offset} ({listed_size} bytes), \
             but it is at {offset} ({size} bytes)")]
    Location {
        listed_offset: u64,
        listed_size: u64,
        offset: u64,
        size: u64,
    },
    #[error("{0} unexpected bytes after the end record")]
    TrailingData(usize),
}

/// What both the local header and the central directory say about an entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct EntryRecord {
    /// Raw name bytes, before any character set decoding
    pub name: Vec<u8>,
    pub crc32: u32,
    pub compressed_size: u64,
    pub size: u64,
}

impl EntryRecord {
    fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Little endian field reader over a byte slice.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DirectoryError> {
        let end = self.pos.checked_add(n)
            .filter(|e| *e <= self.data.len())
            .ok_or(DirectoryError::Truncated(what))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;

        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DirectoryError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DirectoryError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, DirectoryError> {
        let lo = self.u32(what)?;
        let hi = self.u32(what)?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }

    fn peek_u32(&self) -> Option<u32> {
        let b = self.data.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn signature(&mut self, expected: u32, what: &'static str) -> Result<(), DirectoryError> {
        if self.peek_u32() != Some(expected) {
            return Err(DirectoryError::BadSignature(what));
        }
        self.pos += 4;

        Ok(())
    }
}

/// Body of the zip64 extended information extra field, if present.
fn zip64_extra(mut extra: &[u8]) -> Option<&[u8]> {
    while extra.len() >= 4 {
        let id = u16::from_le_bytes([extra[0], extra[1]]);
        let len = usize::from(u16::from_le_bytes([extra[2], extra[3]]));
        let body = extra.get(4..4 + len)?;

        if id == ZIP64_EXTRA_ID {
            return Some(body);
        }
        extra = &extra[4 + len..];
    }

    None
}

/// Check `data`, everything after the last local entry, against `local`.
///
/// `data` must start with the signature of the first central directory
/// header, which sits at `offset` in the archive. `local` maps the offset of
/// each local header to what it said. Up to `max_padding` bytes after the end
/// record are ignored.
pub(crate) fn verify(
    data: &[u8],
    offset: u64,
    local: &BTreeMap<u64, EntryRecord>,
    max_padding: usize,
) -> Result<(), DirectoryError> {
    let mut f = Fields::new(data);
    let mut found = 0u64;

    while f.peek_u32() == Some(CENTRAL_HEADER_SIGNATURE) {
        const WHAT: &str = "central directory header";

        f.signature(CENTRAL_HEADER_SIGNATURE, WHAT)?;
        // Versions, flags, method, time and date
        f.take(12, WHAT)?;
        let crc32 = f.u32(WHAT)?;
        let mut compressed_size = u64::from(f.u32(WHAT)?);
        let mut size = u64::from(f.u32(WHAT)?);
        let name_len = usize::from(f.u16(WHAT)?);
        let extra_len = usize::from(f.u16(WHAT)?);
        let comment_len = usize::from(f.u16(WHAT)?);
        let disk = f.u16(WHAT)?;
        // Internal and external attributes
        f.take(6, WHAT)?;
        let mut header_offset = u64::from(f.u32(WHAT)?);
        let name = f.take(name_len, WHAT)?.to_vec();
        let extra = f.take(extra_len, WHAT)?;
        f.take(comment_len, WHAT)?;

        let max = u64::from(u32::MAX);
        if size == max || compressed_size == max || header_offset == max {
            let body = zip64_extra(extra).ok_or_else(|| DirectoryError::MissingZip64(
                String::from_utf8_lossy(&name).into_owned()))?;
            let mut z = Fields::new(body);

            if size == max {
                size = z.u64("zip64 extra field")?;
            }
            if compressed_size == max {
                compressed_size = z.u64("zip64 extra field")?;
            }
            if header_offset == max {
                header_offset = z.u64("zip64 extra field")?;
            }
        } else if disk != 0 {
            return Err(DirectoryError::MultiDisk);
        }

        let record = EntryRecord {
            name,
            crc32,
            compressed_size,
            size,
        };

        match local.get(&header_offset) {
            Some(l) if *l == record => {}
            Some(l) => return Err(DirectoryError::EntryMismatch {
                name: record.display_name(),
                local: l.display_name(),
            }),
            None => return Err(DirectoryError::UnknownEntry {
                name: record.display_name(),
                offset: header_offset,
            }),
        }

        found += 1;
    }

    let size = f.pos as u64;
    let mut zip64 = None;

    if f.peek_u32() == Some(ZIP64_END_RECORD_SIGNATURE) {
        const WHAT: &str = "zip64 end record";

        f.signature(ZIP64_END_RECORD_SIGNATURE, WHAT)?;
        let record_len = f.u64(WHAT)?;
        let record_len = usize::try_from(record_len).map_err(|_| DirectoryError::Truncated(WHAT))?;
        let mut r = Fields::new(f.take(record_len, WHAT)?);

        // Versions
        r.take(4, WHAT)?;
        if r.u32(WHAT)? != 0 || r.u32(WHAT)? != 0 {
            return Err(DirectoryError::MultiDisk);
        }
        let on_disk = r.u64(WHAT)?;
        let total = r.u64(WHAT)?;
        let listed_size = r.u64(WHAT)?;
        let listed_offset = r.u64(WHAT)?;

        if on_disk != total {
            return Err(DirectoryError::MultiDisk);
        }

        f.signature(ZIP64_LOCATOR_SIGNATURE, "zip64 end record locator")?;
        f.take(16, "zip64 end record locator")?;

        zip64 = Some((total, listed_size, listed_offset));
    }

    const WHAT: &str = "end record";

    f.signature(END_RECORD_SIGNATURE, WHAT)?;
    let disk = f.u16(WHAT)?;
    let directory_disk = f.u16(WHAT)?;
    let on_disk = f.u16(WHAT)?;
    let total = f.u16(WHAT)?;
    let listed_size = f.u32(WHAT)?;
    let listed_offset = f.u32(WHAT)?;
    let comment_len = usize::from(f.u16(WHAT)?);
    f.take(comment_len, WHAT)?;

    let (total, listed_size, listed_offset) = match zip64 {
        Some(z) => z,
        None => {
            if disk != 0 || directory_disk != 0 || on_disk != total {
                return Err(DirectoryError::MultiDisk);
            }

            (u64::from(total), u64::from(listed_size), u64::from(listed_offset))
        }
    };

    if total != found || found != local.len() as u64 {
        return Err(DirectoryError::EntryCount {
            listed: total,
            found: local.len() as u64,
        });
    }

    if listed_offset != offset || listed_size != size {
        return Err(DirectoryError::Location {
            listed_offset,
            listed_size,
            offset,
            size,
        });
    }

    if f.remaining() > max_padding {
        return Err(DirectoryError::TrailingData(f.remaining()));
    }

    Ok(())
}
