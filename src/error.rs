use thiserror::Error;

use crate::record::FileRef;

/// Crate-wide error type. Per-record problems are recovered locally and
/// counted in statistics; the variants here are what callers actually see.
#[derive(Debug, Error)]
pub enum FastFindError {
    /// Raw volume access denied. The engine downgrades to the filesystem
    /// provider when it sees this.
    #[error("raw volume access not permitted")]
    NotPermitted,

    #[error("volume {0}: not NTFS or unreadable")]
    UnsupportedVolume(char),

    /// Too many consecutive malformed records while draining a volume.
    #[error("corrupt volume data after {0} consecutive malformed records")]
    CorruptVolume(u32),

    #[error("corrupt record: {0}")]
    CorruptRecord(&'static str),

    /// The change journal no longer contains the requested USN range.
    /// Callers should schedule a full re-enumeration.
    #[error("journal rewound: requested usn {from}, lowest valid {to}")]
    JournalRewound { from: i64, to: i64 },

    #[error("volume i/o error (os code {code})")]
    VolumeIo { code: i32 },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Parent chain of a record could not be walked back to a volume root.
    #[error("path not resolvable for {0:?}")]
    PathNotResolvable(FileRef),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// Cooperative cancellation. Not an error at the API surface; callers
    /// that observe it report a clean early exit.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FastFindError>;

impl FastFindError {
    /// True for errors that abort only the volume they occurred on.
    pub fn is_volume_local(&self) -> bool {
        matches!(
            self,
            FastFindError::UnsupportedVolume(_)
                | FastFindError::CorruptVolume(_)
                | FastFindError::VolumeIo { .. }
        )
    }
}
