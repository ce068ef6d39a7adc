//! Raw NTFS volume access: MFT enumeration and USN journal reading over
//! `DeviceIoControl`. Everything in the submodules is Windows-only; this
//! gateway gives the rest of the crate a portable surface that reports
//! "no raw access" elsewhere, which downgrades the engine to the
//! filesystem provider.

#[cfg(target_os = "windows")]
pub mod journal;
#[cfg(target_os = "windows")]
pub mod mft;
#[cfg(target_os = "windows")]
pub mod volume;

use crate::error::Result;

/// Geometry and scale of one NTFS volume, from FSCTL_GET_NTFS_VOLUME_DATA.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VolumeInfo {
    /// Volume label, e.g. `C:`.
    pub volume: String,
    pub bytes_per_sector: u32,
    pub bytes_per_cluster: u32,
    pub bytes_per_mft_record: u32,
    /// MFT valid data length divided by record size: an upper bound on
    /// live records, used to pre-size the index.
    pub estimated_record_count: u64,
}

/// True iff the process can open a raw volume handle (elevation). The
/// check actually opens a volume; there is no reliable cheaper probe.
#[cfg(target_os = "windows")]
pub fn is_available() -> bool {
    ntfs_volumes()
        .first()
        .map(|v| volume::open_volume(v).is_ok())
        .unwrap_or(false)
}

#[cfg(not(target_os = "windows"))]
pub fn is_available() -> bool {
    false
}

/// Local fixed NTFS volumes, as `C:`-style labels.
#[cfg(target_os = "windows")]
pub fn ntfs_volumes() -> Vec<String> {
    volume::ntfs_volumes()
}

#[cfg(not(target_os = "windows"))]
pub fn ntfs_volumes() -> Vec<String> {
    Vec::new()
}

#[cfg(target_os = "windows")]
pub fn volume_info(volume_label: &str) -> Result<VolumeInfo> {
    volume::volume_info(volume_label)
}

#[cfg(not(target_os = "windows"))]
pub fn volume_info(_volume_label: &str) -> Result<VolumeInfo> {
    Err(crate::error::FastFindError::NotPermitted)
}

#[cfg(test)]
mod tests {
    #[cfg(not(target_os = "windows"))]
    #[test]
    fn non_windows_reports_unavailable() {
        assert!(!super::is_available());
        assert!(super::ntfs_volumes().is_empty());
        assert!(super::volume_info("C:").is_err());
    }
}
