//! Error types for CHFS
//!
//! One error enum is shared by the eraseblock handler, the node log and
//! the garbage collector. Out-of-space is kept apart from I/O failure so
//! callers can tell "try again after GC" from "the media is broken".

use crate::types::{Lnr, Pebnr, Vno};
use thiserror::Error;

/// Common result type for CHFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CHFS
#[derive(Debug, Error)]
pub enum Error {
    // Media errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("flash I/O error on {lnr} at offset {offset}: {reason}")]
    Flash { lnr: Lnr, offset: u32, reason: String },

    #[error("flash device error: {0}")]
    Device(String),

    #[error("erase of {peb} failed")]
    EraseFailed { peb: Pebnr },

    #[error("{peb} is a bad block")]
    BadBlock { peb: Pebnr },

    // Integrity errors
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt record at {lnr}:{offset}: {reason}")]
    Corrupt { lnr: Lnr, offset: u32, reason: String },

    #[error("malformed on-media data: {0}")]
    Malformed(String),

    // Space errors
    #[error("no space left on flash")]
    NoSpace,

    // Usage errors
    #[error("{0} is not mapped")]
    LebUnmapped(Lnr),

    #[error("{0} is already mapped")]
    LebMapped(Lnr),

    #[error("vnode {0} not found")]
    VnodeNotFound(Vno),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a flash I/O error for a LEB position
    pub fn flash(lnr: Lnr, offset: u32, reason: impl Into<String>) -> Self {
        Self::Flash {
            lnr,
            offset,
            reason: reason.into(),
        }
    }

    /// Create a corrupt-record error
    pub fn corrupt(lnr: Lnr, offset: u32, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            lnr,
            offset,
            reason: reason.into(),
        }
    }

    /// Check if this error means the flash ran out of space
    #[must_use]
    pub const fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }

    /// Check if this error means on-media data failed validation
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Corrupt { .. } | Self::Malformed(_)
        )
    }

    /// Check if this error came from the media itself
    #[must_use]
    pub const fn is_media_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Flash { .. }
                | Self::Device(_)
                | Self::EraseFailed { .. }
                | Self::BadBlock { .. }
        )
    }

    /// Map to the errno a filesystem layer would report
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NoSpace => libc::ENOSPC,
            Self::Io(_)
            | Self::Flash { .. }
            | Self::Device(_)
            | Self::EraseFailed { .. }
            | Self::BadBlock { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Corrupt { .. }
            | Self::Malformed(_) => libc::EIO,
            Self::VnodeNotFound(_) | Self::NotFound(_) => libc::ENOENT,
            Self::LebUnmapped(_)
            | Self::LebMapped(_)
            | Self::InvalidArgument(_)
            | Self::Configuration(_) => libc::EINVAL,
            Self::Internal(_) => libc::EFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::flash(Lnr::new(3), 128, "short write");
        assert_eq!(
            err.to_string(),
            "flash I/O error on leb3 at offset 128: short write"
        );

        let err = Error::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0x1234,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0xdeadbeef, got 0x00001234"
        );
    }

    #[test]
    fn test_no_space_is_not_media_error() {
        assert!(Error::NoSpace.is_no_space());
        assert!(!Error::NoSpace.is_media_error());
        assert!(Error::device("gone").is_media_error());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(Error::flash(Lnr::new(0), 0, "x").errno(), libc::EIO);
        assert_eq!(Error::LebUnmapped(Lnr::new(1)).errno(), libc::EINVAL);
        assert_eq!(Error::VnodeNotFound(Vno::new(9)).errno(), libc::ENOENT);
    }

    #[test]
    fn test_corruption_classification() {
        assert!(Error::corrupt(Lnr::new(2), 8, "bad magic").is_corruption());
        assert!(Error::Malformed("short".into()).is_corruption());
        assert!(!Error::NoSpace.is_corruption());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
