//! MFT drain: FSCTL_ENUM_USN_DATA in a cursor loop, parsing each output
//! buffer with the shared USN record walker and interning names straight
//! from the decode scratch, no per-record allocation beyond the pool.

use std::mem;

use crossbeam_channel::Sender;
use log::{debug, info};
use windows::Win32::System::Ioctl::FSCTL_ENUM_USN_DATA;
use windows::Win32::System::IO::DeviceIoControl;

use crate::cancel::CancellationToken;
use crate::error::{FastFindError, Result};
use crate::index::FileIndex;
use crate::record::{CompactRecord, FileRef};
use crate::strings::StringPool;
use crate::usn::{split_cursor, RecordWalker};
use crate::win::volume::{self, VolumeHandle};

/// Default read buffer; clamped to [64 KiB, 4 MiB] and rounded to 4 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
const MIN_BUFFER_SIZE: usize = 64 * 1024;
const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const ERROR_HANDLE_EOF: i32 = 38;

/// NTFS root directory record number.
pub const ROOT_RECORD_NUMBER: u64 = 5;

#[repr(C)]
struct MftEnumDataV0 {
    start_file_reference_number: u64,
    low_usn: i64,
    high_usn: i64,
}

pub(crate) fn clamp_buffer_size(requested: usize) -> usize {
    requested.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE) & !0xFFF
}

/// Streaming reader over one volume's MFT. Each `next_chunk` issues one
/// enumeration IOCTL and parses the returned buffer; a fresh reader
/// restarts from the top of the table.
pub struct MftReader {
    vol: VolumeHandle,
    buffer: Vec<u8>,
    cursor: u64,
    malformed_run: u32,
    done: bool,
    scratch: String,
}

impl MftReader {
    pub fn open(volume_label: &str) -> Result<Self> {
        Self::with_buffer_size(volume_label, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(volume_label: &str, buffer_size: usize) -> Result<Self> {
        let vol = volume::open_volume(volume_label)?;
        Ok(MftReader {
            vol,
            buffer: vec![0u8; clamp_buffer_size(buffer_size)],
            cursor: 0,
            malformed_run: 0,
            done: false,
            scratch: String::with_capacity(260),
        })
    }

    pub fn volume(&self) -> &str {
        self.vol.label()
    }

    /// Parse the next buffer of live records, names interned into `pool`.
    /// `Ok(None)` at end of MFT; the malformed-run threshold carries
    /// across chunks.
    pub fn next_chunk(&mut self, pool: &StringPool) -> Result<Option<Vec<CompactRecord>>> {
        if self.done {
            return Ok(None);
        }
        let input = MftEnumDataV0 {
            start_file_reference_number: self.cursor,
            low_usn: 0,
            high_usn: i64::MAX,
        };
        let mut bytes_returned: u32 = 0;
        let io = unsafe {
            DeviceIoControl(
                self.vol.raw(),
                FSCTL_ENUM_USN_DATA,
                Some(&input as *const _ as *const _),
                mem::size_of::<MftEnumDataV0>() as u32,
                Some(self.buffer.as_mut_ptr() as *mut _),
                self.buffer.len() as u32,
                Some(&mut bytes_returned),
                None,
            )
        };
        if let Err(e) = io {
            let mapped = volume::os_error(e);
            if let FastFindError::VolumeIo { code } = mapped {
                if code == ERROR_HANDLE_EOF {
                    self.done = true;
                    return Ok(None);
                }
            }
            return Err(mapped);
        }

        let Some((next_cursor, records)) = split_cursor(&self.buffer[..bytes_returned as usize])
        else {
            self.done = true;
            return Ok(None);
        };

        let mut out = Vec::new();
        let mut walker = RecordWalker::with_malformed_run(records, self.malformed_run);
        while let Some(meta) = walker.next(&mut self.scratch)? {
            out.push(CompactRecord {
                file_ref: meta.file_ref,
                parent_ref: meta.parent_ref,
                name_id: pool.intern_name(&self.scratch),
                attributes: meta.attributes,
                // The MFT-only path carries no sizes; the opt-in
                // collection pass backfills them.
                size: 0,
                modified_ticks: meta.timestamp_ticks,
            });
        }
        self.malformed_run = walker.malformed_run();
        self.cursor = next_cursor;
        Ok(Some(out))
    }
}

/// Drain one volume into the ingest queue: registers the volume root,
/// then streams every live record in MFT order.
pub fn drain_volume(
    volume_label: &str,
    index: &FileIndex,
    tx: &Sender<CompactRecord>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut reader = MftReader::open(volume_label)?;
    let label = reader.volume().to_string();
    index.register_root(FileRef::from_parts(ROOT_RECORD_NUMBER, 5), &label);
    info!("mft drain starting on {label}");

    let mut total: u64 = 0;
    while let Some(chunk) = reader.next_chunk(index.pool())? {
        if cancel.is_cancelled() {
            debug!("mft drain cancelled on {label} after {total} records");
            return Ok(());
        }
        for rec in chunk {
            total += 1;
            if tx.send(rec).is_err() {
                // Consumer is gone; treat as cancellation.
                return Ok(());
            }
        }
    }
    info!("mft drain finished on {label}: {total} records");
    Ok(())
}
