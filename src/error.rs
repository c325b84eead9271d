//! Centralized error types for relaymail.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the relaymail library.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No supported USB modem is attached.
    #[error("No modem plugged in")]
    NoModem,

    /// A modem is attached but none of the known variants matched it.
    #[error("Unknown modem: none of [{tried}] detected")]
    UnknownModem { tried: String },

    /// A bounded wait for the device or the link ran out.
    #[error("Timed out after {attempts} attempts waiting for {what}")]
    ConnectivityTimeout { what: String, attempts: u32 },

    /// An external tool (`lsusb`, `usb_modeswitch`, `wvdial`) failed.
    #[error("Command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    /// The remote sync transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The raw MIME message could not be turned into an email.
    #[error("Could not parse MIME message '{resource_id}': {reason}")]
    Parse { resource_id: String, reason: String },

    /// A blob or record was not found in storage.
    #[error("Not found in storage: {0}")]
    NotFound(String),

    /// A durable store failed to read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The message broker failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map an `io::Error` on a keyed resource, turning `NotFound` into [`RelayError::NotFound`].
    pub fn storage(path: impl Into<PathBuf>, key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(key.to_string())
        } else {
            Self::io(path, source)
        }
    }

    /// `true` for the storage family of errors (missing blob, failed write, file I/O).
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Storage(_) | Self::Io { .. })
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `RelayError::io`).
impl From<std::io::Error> for RelayError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_maps_not_found() {
        let err = RelayError::storage(
            "/tmp/blobs/abc",
            "abc",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, RelayError::NotFound(ref key) if key == "abc"));
        assert!(err.is_storage());
    }

    #[test]
    fn test_storage_keeps_other_io_errors() {
        let err = RelayError::storage(
            "/tmp/blobs/abc",
            "abc",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, RelayError::Io { .. }));
    }

    #[test]
    fn test_parse_error_mentions_resource() {
        let err = RelayError::Parse {
            resource_id: "r-42".into(),
            reason: "no From header".into(),
        };
        assert!(err.to_string().contains("r-42"));
        assert!(!err.is_storage());
    }
}
