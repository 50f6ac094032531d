//! Error types for hwvideo.

use thiserror::Error;

/// Result type alias using hwvideo's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for codec session operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested codec, format, or capability is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Frame dimensions must be even for 4:2:0 surfaces.
    #[error("odd dimensions not supported: {width}x{height}")]
    OddDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// No adapter matched the requested identity or vendor.
    #[error("adapter not found: {0:#x}")]
    AdapterNotFound(u64),

    /// A parameter failed validation before reaching the device.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The component reported busy past the retry ceiling.
    #[error("pipeline stalled: component still busy after {retries} retries")]
    Stall {
        /// Number of submit attempts made before giving up.
        retries: u32,
    },

    /// Surface pool is exhausted (no free slots).
    #[error("surface pool exhausted: no slots available")]
    PoolExhausted,

    /// A mid-stream parameter change was rejected by the component.
    #[error("incompatible parameter change: {0}")]
    Incompatible(String),

    /// Completion synchronization did not finish within the bound.
    #[error("synchronization timed out after {0:?}")]
    SyncTimeout(std::time::Duration),

    /// The underlying device was lost or removed.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// The session has entered the failed state; only teardown is valid.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// Bitstream or frame data could not be parsed.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error leaves the session unusable (teardown only).
    ///
    /// Per-frame errors are recoverable: the caller may submit the next
    /// frame. Device loss and failed reconfiguration are not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceLost(_) | Error::SessionFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::DeviceLost("removed".into()).is_fatal());
        assert!(Error::SessionFailed("reset failed".into()).is_fatal());
        assert!(!Error::PoolExhausted.is_fatal());
        assert!(!Error::Stall { retries: 100 }.is_fatal());
        assert!(!Error::InvalidParameter("qp".into()).is_fatal());
    }

    #[test]
    fn display_messages() {
        let e = Error::OddDimensions {
            width: 1921,
            height: 1080,
        };
        assert_eq!(e.to_string(), "odd dimensions not supported: 1921x1080");

        let e = Error::Stall { retries: 100 };
        assert!(e.to_string().contains("100 retries"));
    }
}
