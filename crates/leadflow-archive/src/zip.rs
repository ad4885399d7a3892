//! Stored (uncompressed) ZIP container writer + a small central-directory reader.

use crate::crc::crc32;
use crate::ArchiveError;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;
const VERSION: u16 = 20;
const METHOD_STORED: u16 = 0;
const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_RECORD_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl ZipEntry {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Central-directory view of one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub crc32: u32,
    pub size: u32,
    pub local_header_offset: u32,
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn to_u32(value: usize) -> Result<u32, ArchiveError> {
    u32::try_from(value).map_err(|_| ArchiveError::ArchiveTooLarge(value))
}

/// Pack `entries` in order: local header + raw bytes per entry, then the
/// central directory, then the end-of-central-directory record.
pub fn write_stored_zip(entries: &[ZipEntry]) -> Result<Vec<u8>, ArchiveError> {
    let count = u16::try_from(entries.len()).map_err(|_| ArchiveError::TooManyEntries(entries.len()))?;

    let mut body = Vec::new();
    let mut central = Vec::new();

    for entry in entries {
        let name = entry.name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| ArchiveError::EntryTooLarge {
            name: entry.name.clone(),
            len: name.len(),
        })?;
        let size = u32::try_from(entry.data.len()).map_err(|_| ArchiveError::EntryTooLarge {
            name: entry.name.clone(),
            len: entry.data.len(),
        })?;
        let crc = crc32(&entry.data);
        let offset = to_u32(body.len())?;

        put_u32(&mut body, LOCAL_HEADER_SIG);
        put_u16(&mut body, VERSION);
        put_u16(&mut body, 0); // flags
        put_u16(&mut body, METHOD_STORED);
        put_u16(&mut body, 0); // mod time
        put_u16(&mut body, 0); // mod date
        put_u32(&mut body, crc);
        put_u32(&mut body, size);
        put_u32(&mut body, size);
        put_u16(&mut body, name_len);
        put_u16(&mut body, 0); // extra
        body.extend_from_slice(name);
        body.extend_from_slice(&entry.data);

        put_u32(&mut central, CENTRAL_HEADER_SIG);
        put_u16(&mut central, VERSION); // made by
        put_u16(&mut central, VERSION); // needed
        put_u16(&mut central, 0);
        put_u16(&mut central, METHOD_STORED);
        put_u16(&mut central, 0);
        put_u16(&mut central, 0);
        put_u32(&mut central, crc);
        put_u32(&mut central, size);
        put_u32(&mut central, size);
        put_u16(&mut central, name_len);
        put_u16(&mut central, 0); // extra
        put_u16(&mut central, 0); // comment
        put_u16(&mut central, 0); // disk start
        put_u16(&mut central, 0); // internal attrs
        put_u32(&mut central, 0); // external attrs
        put_u32(&mut central, offset);
        central.extend_from_slice(name);
    }

    let central_offset = to_u32(body.len())?;
    let central_size = to_u32(central.len())?;
    to_u32(body.len() + central.len() + END_RECORD_LEN)?;

    let mut out = body;
    out.extend_from_slice(&central);
    put_u32(&mut out, END_OF_CENTRAL_DIR_SIG);
    put_u16(&mut out, 0); // this disk
    put_u16(&mut out, 0); // central dir disk
    put_u16(&mut out, count);
    put_u16(&mut out, count);
    put_u32(&mut out, central_size);
    put_u32(&mut out, central_offset);
    put_u16(&mut out, 0); // comment
    Ok(out)
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, ArchiveError> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ArchiveError::Malformed("truncated u16"))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ArchiveError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ArchiveError::Malformed("truncated u32"))
}

/// Parse the central directory of an archive without a trailing comment and
/// check every entry's stored bytes against its recorded CRC.
pub fn list_entries(archive: &[u8]) -> Result<Vec<ListedEntry>, ArchiveError> {
    let end = archive
        .len()
        .checked_sub(END_RECORD_LEN)
        .ok_or(ArchiveError::Malformed("archive shorter than end record"))?;
    if read_u32(archive, end)? != END_OF_CENTRAL_DIR_SIG {
        return Err(ArchiveError::Malformed("missing end-of-central-directory record"));
    }
    let count = read_u16(archive, end + 10)? as usize;
    let central_size = read_u32(archive, end + 12)? as usize;
    let mut at = read_u32(archive, end + 16)? as usize;
    if at + central_size != end {
        return Err(ArchiveError::Malformed("central directory bounds disagree"));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if read_u32(archive, at)? != CENTRAL_HEADER_SIG {
            return Err(ArchiveError::Malformed("bad central header signature"));
        }
        let crc = read_u32(archive, at + 16)?;
        let size = read_u32(archive, at + 20)?;
        let name_len = read_u16(archive, at + 28)? as usize;
        let extra_len = read_u16(archive, at + 30)? as usize;
        let comment_len = read_u16(archive, at + 32)? as usize;
        let local_offset = read_u32(archive, at + 42)?;
        let name_start = at + CENTRAL_HEADER_LEN;
        let name = archive
            .get(name_start..name_start + name_len)
            .ok_or(ArchiveError::Malformed("truncated entry name"))?;
        let name = String::from_utf8_lossy(name).to_string();

        let local = local_offset as usize;
        if read_u32(archive, local)? != LOCAL_HEADER_SIG {
            return Err(ArchiveError::Malformed("bad local header signature"));
        }
        let local_name_len = read_u16(archive, local + 26)? as usize;
        let local_extra_len = read_u16(archive, local + 28)? as usize;
        let data_start = local + LOCAL_HEADER_LEN + local_name_len + local_extra_len;
        let data = archive
            .get(data_start..data_start + size as usize)
            .ok_or(ArchiveError::Malformed("truncated entry data"))?;
        if crc32(data) != crc {
            return Err(ArchiveError::CrcMismatch { name });
        }

        entries.push(ListedEntry {
            name,
            crc32: crc,
            size,
            local_header_offset: local_offset,
        });
        at = name_start + name_len + extra_len + comment_len;
    }
    Ok(entries)
}
