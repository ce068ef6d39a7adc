//! Byte-level parsing of USN_RECORD_V2/V3 buffers as returned by the
//! MFT-enumeration and read-journal volume controls. Little-endian,
//! zero-copy: names are decoded into a caller-owned scratch buffer so the
//! hot loop never allocates per record.

use crate::error::{FastFindError, Result};
use crate::record::{filetime_to_ticks, FileAttributes, FileRef};

/// Minimum bytes a record must declare to cover the fixed header.
pub const MIN_RECORD_LEN: usize = 60;

/// Consecutive malformed records tolerated before the enumeration fails.
pub const MAX_MALFORMED_RUN: u32 = 16;

// USN_REASON_* flags (the full mask set the journal reader subscribes to).
pub const REASON_DATA_OVERWRITE: u32 = 0x0000_0001;
pub const REASON_DATA_EXTEND: u32 = 0x0000_0002;
pub const REASON_DATA_TRUNCATION: u32 = 0x0000_0004;
pub const REASON_FILE_CREATE: u32 = 0x0000_0100;
pub const REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const REASON_EA_CHANGE: u32 = 0x0000_0400;
pub const REASON_SECURITY_CHANGE: u32 = 0x0000_0800;
pub const REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const REASON_BASIC_INFO_CHANGE: u32 = 0x0000_8000;
pub const REASON_CLOSE: u32 = 0x8000_0000;

pub const REASON_MASK_ALL: u32 = 0xFFFF_FFFF;

/// Journal reasons grouped the way the sync adapter consumes them. A raw
/// mask can carry several bits; grouping picks the strongest existence
/// change first so a create+close record still counts as a create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Created,
    Deleted,
    RenamedOld,
    RenamedNew,
    DataModified,
    AttrsChanged,
    Closed,
}

impl ChangeReason {
    pub fn from_mask(mask: u32) -> ChangeReason {
        if mask & REASON_FILE_DELETE != 0 {
            ChangeReason::Deleted
        } else if mask & REASON_FILE_CREATE != 0 {
            ChangeReason::Created
        } else if mask & REASON_RENAME_OLD_NAME != 0 {
            ChangeReason::RenamedOld
        } else if mask & REASON_RENAME_NEW_NAME != 0 {
            ChangeReason::RenamedNew
        } else if mask & (REASON_DATA_OVERWRITE | REASON_DATA_EXTEND | REASON_DATA_TRUNCATION) != 0
        {
            ChangeReason::DataModified
        } else if mask
            & (REASON_BASIC_INFO_CHANGE | REASON_EA_CHANGE | REASON_SECURITY_CHANGE)
            != 0
        {
            ChangeReason::AttrsChanged
        } else {
            ChangeReason::Closed
        }
    }
}

/// Numeric fields of one parsed record. The name lands in the scratch
/// buffer handed to the parser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordMeta {
    pub len: usize,
    pub file_ref: FileRef,
    pub parent_ref: FileRef,
    pub usn: i64,
    pub timestamp_ticks: u64,
    pub reason: u32,
    pub attributes: FileAttributes,
}

/// Why a single record was rejected. `BadLength` poisons the rest of the
/// buffer (the walker cannot trust the next offset); everything else skips
/// exactly the declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDefect {
    BadLength,
    BadVersion,
    BadName,
    MetadataName,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

/// Parse one record at the head of `data`. On success the UTF-16LE name is
/// decoded into `scratch` (cleared first). Records named like NTFS
/// metadata files (`$Mft`, `$Extend`, ...) are rejected with
/// `MetadataName` so callers drop them without counting a malformed run.
pub fn parse_record(
    data: &[u8],
    scratch: &mut String,
) -> std::result::Result<RecordMeta, RecordDefect> {
    if data.len() < 4 {
        return Err(RecordDefect::BadLength);
    }
    let len = read_u32(data, 0) as usize;
    if len == 0 || len < MIN_RECORD_LEN || len > data.len() {
        return Err(RecordDefect::BadLength);
    }

    let major = read_u16(data, 4);
    if major != 2 && major != 3 {
        return Err(RecordDefect::BadVersion);
    }

    let file_ref = FileRef::new(read_u64(data, 8));
    let parent_ref = FileRef::new(read_u64(data, 16));
    let usn = read_u64(data, 24) as i64;
    let timestamp_ticks = filetime_to_ticks(read_u64(data, 32) as i64);
    let reason = read_u32(data, 40);
    let attributes = FileAttributes(read_u32(data, 52));

    let name_len = read_u16(data, 56) as usize;
    let name_offset = read_u16(data, 58) as usize;
    if name_len == 0 || name_offset + name_len > len {
        return Err(RecordDefect::BadName);
    }

    scratch.clear();
    let name_bytes = &data[name_offset..name_offset + name_len];
    for unit in char::decode_utf16(
        name_bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]])),
    ) {
        scratch.push(unit.unwrap_or(char::REPLACEMENT_CHARACTER));
    }

    if scratch.starts_with('$') {
        return Err(RecordDefect::MetadataName);
    }

    Ok(RecordMeta {
        len,
        file_ref,
        parent_ref,
        usn,
        timestamp_ticks,
        reason,
        attributes,
    })
}

/// Split an IOCTL output buffer into its leading 8-byte cursor and the
/// record bytes that follow. Returns None when the kernel handed back less
/// than a cursor, which terminates the enumeration.
pub fn split_cursor(buf: &[u8]) -> Option<(u64, &[u8])> {
    if buf.len() < 8 {
        return None;
    }
    Some((read_u64(buf, 0), &buf[8..]))
}

/// Walks the records of one output buffer. The malformed-run counter lives
/// here and carries across buffers via `with_malformed_run`, so a volume
/// whose corruption spans a buffer boundary still trips the threshold.
pub struct RecordWalker<'a> {
    buf: &'a [u8],
    offset: usize,
    malformed_run: u32,
}

impl<'a> RecordWalker<'a> {
    pub fn new(records: &'a [u8]) -> Self {
        RecordWalker {
            buf: records,
            offset: 0,
            malformed_run: 0,
        }
    }

    pub fn with_malformed_run(records: &'a [u8], malformed_run: u32) -> Self {
        RecordWalker {
            buf: records,
            offset: 0,
            malformed_run,
        }
    }

    pub fn malformed_run(&self) -> u32 {
        self.malformed_run
    }

    /// Next well-formed record, skipping tolerable defects. Returns
    /// `Ok(None)` at end of buffer or at a corrupt length field (which
    /// makes the remaining bytes unwalkable), `Err(CorruptVolume)` once
    /// the malformed run crosses the threshold.
    pub fn next(&mut self, scratch: &mut String) -> Result<Option<RecordMeta>> {
        loop {
            if self.offset >= self.buf.len() {
                return Ok(None);
            }
            match parse_record(&self.buf[self.offset..], scratch) {
                Ok(meta) => {
                    self.offset += meta.len;
                    self.malformed_run = 0;
                    return Ok(Some(meta));
                }
                Err(RecordDefect::BadLength) => {
                    // Length field is untrustworthy: cannot advance.
                    return Ok(None);
                }
                Err(RecordDefect::MetadataName) => {
                    // NTFS metadata file, dropped silently.
                    let len = read_u32(&self.buf[self.offset..], 0) as usize;
                    self.offset += len;
                    self.malformed_run = 0;
                }
                Err(_) => {
                    let len = read_u32(&self.buf[self.offset..], 0) as usize;
                    self.offset += len;
                    self.malformed_run += 1;
                    if self.malformed_run >= MAX_MALFORMED_RUN {
                        return Err(FastFindError::CorruptVolume(self.malformed_run));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_record(
    file_ref: u64,
    parent_ref: u64,
    usn: i64,
    timestamp: i64,
    reason: u32,
    attributes: u32,
    name: &str,
    major: u16,
) -> Vec<u8> {
    let name_units: Vec<u16> = name.encode_utf16().collect();
    let name_offset = 60usize;
    let mut len = name_offset + name_units.len() * 2;
    // Records are 8-byte aligned on the wire.
    len = (len + 7) & !7;

    let mut buf = vec![0u8; len];
    buf[0..4].copy_from_slice(&(len as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&major.to_le_bytes());
    buf[8..16].copy_from_slice(&file_ref.to_le_bytes());
    buf[16..24].copy_from_slice(&parent_ref.to_le_bytes());
    buf[24..32].copy_from_slice(&usn.to_le_bytes());
    buf[32..40].copy_from_slice(&timestamp.to_le_bytes());
    buf[40..44].copy_from_slice(&reason.to_le_bytes());
    buf[52..56].copy_from_slice(&attributes.to_le_bytes());
    buf[56..58].copy_from_slice(&((name_units.len() * 2) as u16).to_le_bytes());
    buf[58..60].copy_from_slice(&(name_offset as u16).to_le_bytes());
    for (i, unit) in name_units.iter().enumerate() {
        buf[name_offset + i * 2..name_offset + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    buf
}
