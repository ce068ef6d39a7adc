//! Raw volume handles and journal metadata queries. The handle wraps
//! `\\.\X:` opened with read sharing; all byte-level parsing of IOCTL
//! output stays here so callers never touch raw buffers.

use std::mem;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{
    FSCTL_CREATE_USN_JOURNAL, FSCTL_GET_NTFS_VOLUME_DATA, FSCTL_QUERY_USN_JOURNAL,
};
use windows::Win32::System::IO::DeviceIoControl;

use crate::error::{FastFindError, Result};
use crate::win::VolumeInfo;

const GENERIC_READ: u32 = 0x8000_0000;
const ERROR_ACCESS_DENIED: i32 = 5;

/// Owned raw volume handle, closed on drop.
#[derive(Debug)]
pub struct VolumeHandle {
    handle: HANDLE,
    label: String,
}

// SAFETY: NTFS volume handles are plain kernel objects, safe to use from
// any thread.
unsafe impl Send for VolumeHandle {}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl VolumeHandle {
    pub fn raw(&self) -> HANDLE {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Map a failed Win32 call to the crate error model: access denied means
/// "run unelevated, use the walk provider", everything else is a volume
/// I/O failure carrying the OS code.
pub(crate) fn os_error(e: windows::core::Error) -> FastFindError {
    let code = e.code().0 & 0xFFFF;
    if code == ERROR_ACCESS_DENIED {
        FastFindError::NotPermitted
    } else {
        FastFindError::VolumeIo { code }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Open `\\.\X:` for the given `X:`-style label. Requires elevation.
pub fn open_volume(volume_label: &str) -> Result<VolumeHandle> {
    let label = volume_label.trim_end_matches('\\').to_string();
    let path = wide(&format!("\\\\.\\{label}"));

    let handle = unsafe {
        CreateFileW(
            PCWSTR(path.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            None,
        )
        .map_err(os_error)?
    };

    Ok(VolumeHandle { handle, label })
}

/// USN_JOURNAL_DATA_V0, parsed from its 56-byte wire form.
#[derive(Debug, Clone, Copy)]
pub struct UsnJournalData {
    pub journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    pub lowest_valid_usn: i64,
    pub max_usn: i64,
}

pub fn query_journal(vol: &VolumeHandle) -> Result<UsnJournalData> {
    let mut buffer = [0u8; 56];
    let mut bytes_returned: u32 = 0;

    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(buffer.as_mut_ptr() as *mut _),
            buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
        .map_err(os_error)?;
    }
    if (bytes_returned as usize) < 56 {
        return Err(FastFindError::CorruptRecord("short USN_JOURNAL_DATA"));
    }

    let u64_at = |at: usize| u64::from_le_bytes(buffer[at..at + 8].try_into().unwrap());
    Ok(UsnJournalData {
        journal_id: u64_at(0),
        first_usn: u64_at(8) as i64,
        next_usn: u64_at(16) as i64,
        lowest_valid_usn: u64_at(24) as i64,
        max_usn: u64_at(32) as i64,
    })
}

/// CREATE_USN_JOURNAL_DATA with the documented defaults Everything-style
/// indexers use: 32 MiB journal, 8 MiB allocation delta.
pub fn create_journal(vol: &VolumeHandle) -> Result<()> {
    #[repr(C)]
    struct CreateUsnJournalData {
        maximum_size: u64,
        allocation_delta: u64,
    }
    let input = CreateUsnJournalData {
        maximum_size: 32 * 1024 * 1024,
        allocation_delta: 8 * 1024 * 1024,
    };
    let mut bytes_returned: u32 = 0;
    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_CREATE_USN_JOURNAL,
            Some(&input as *const _ as *const _),
            mem::size_of::<CreateUsnJournalData>() as u32,
            None,
            0,
            Some(&mut bytes_returned),
            None,
        )
        .map_err(os_error)?;
    }
    Ok(())
}

/// NTFS_VOLUME_DATA_BUFFER, the fields the reader sizes itself with.
pub fn volume_info(volume_label: &str) -> Result<VolumeInfo> {
    let vol = open_volume(volume_label)?;
    let mut buffer = [0u8; 96];
    let mut bytes_returned: u32 = 0;
    unsafe {
        DeviceIoControl(
            vol.raw(),
            FSCTL_GET_NTFS_VOLUME_DATA,
            None,
            0,
            Some(buffer.as_mut_ptr() as *mut _),
            buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
        .map_err(os_error)?;
    }
    if (bytes_returned as usize) < 64 {
        return Err(FastFindError::UnsupportedVolume(
            volume_label.chars().next().unwrap_or('?'),
        ));
    }

    let u32_at = |at: usize| u32::from_le_bytes(buffer[at..at + 4].try_into().unwrap());
    let u64_at = |at: usize| u64::from_le_bytes(buffer[at..at + 8].try_into().unwrap());

    // Layout: serial(8) sectors(8) total_clusters(8) free_clusters(8)
    // reserved(8) bytes/sector(4) bytes/cluster(4) bytes/record(4)
    // clusters/record(4) mft_valid_data_length(8) ...
    let bytes_per_sector = u32_at(40);
    let bytes_per_cluster = u32_at(44);
    let bytes_per_mft_record = u32_at(48);
    let mft_valid_data_length = u64_at(56);

    Ok(VolumeInfo {
        volume: vol.label().to_string(),
        bytes_per_sector,
        bytes_per_cluster,
        bytes_per_mft_record,
        estimated_record_count: if bytes_per_mft_record > 0 {
            mft_valid_data_length / bytes_per_mft_record as u64
        } else {
            0
        },
    })
}

const DRIVE_FIXED: u32 = 3;

/// Local fixed volumes whose filesystem reports as NTFS.
pub fn ntfs_volumes() -> Vec<String> {
    let mask = unsafe { GetLogicalDrives() };
    let mut volumes = Vec::new();
    for i in 0..26u32 {
        if mask & (1 << i) == 0 {
            continue;
        }
        let letter = (b'A' + i as u8) as char;
        let root = wide(&format!("{letter}:\\"));
        let drive_type = unsafe { GetDriveTypeW(PCWSTR(root.as_ptr())) };
        if drive_type != DRIVE_FIXED {
            continue;
        }
        let mut fs_name = [0u16; 32];
        let ok = unsafe {
            GetVolumeInformationW(
                PCWSTR(root.as_ptr()),
                None,
                None,
                None,
                None,
                Some(&mut fs_name),
            )
        };
        if ok.is_err() {
            continue;
        }
        let end = fs_name.iter().position(|&c| c == 0).unwrap_or(fs_name.len());
        if String::from_utf16_lossy(&fs_name[..end]).eq_ignore_ascii_case("NTFS") {
            volumes.push(format!("{letter}:"));
        }
    }
    volumes
}
