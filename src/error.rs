//! Error taxonomy for the download engine.
//!
//! Construction-time problems (missing url/identity/path) fail fast from
//! `JobBuilder::build`. Anything that happens inside a worker is reported
//! upward as a `DownloadEvent::Failed` carrying one of these, never thrown
//! across a worker boundary.

use thiserror::Error;

/// Stable failure causes surfaced to the caller.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Job was built without a download URL.
    #[error("download url is missing")]
    UrlMissing,

    /// Job was built without a stable identity key.
    #[error("job identity is missing")]
    IdentityMissing,

    /// Job was built without a destination path.
    #[error("destination path is missing")]
    SavePathMissing,

    /// Probe got an unusable response: bad status or non-positive size.
    #[error("remote file unavailable: {0}")]
    RemoteFile(String),

    /// Network / protocol / timeout failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Local file I/O failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Completed file did not match the expected content hash.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Engine method called before startup recovery finished.
    #[error("engine is not ready")]
    NotReady,
}

impl From<curl::Error> for DownloadError {
    fn from(e: curl::Error) -> Self {
        DownloadError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(DownloadError::UrlMissing.to_string(), "download url is missing");
        assert_eq!(DownloadError::NotReady.to_string(), "engine is not ready");
        let e = DownloadError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(e.to_string(), "checksum mismatch: expected aa, got bb");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e: DownloadError = io.into();
        assert!(matches!(e, DownloadError::Io(_)));
    }
}
