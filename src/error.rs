//! Error taxonomy shared by every storage operation.

use thiserror::Error;

use crate::storage::address::DeviceAddress;

/// Failure reported by a [`DiskBackend`](crate::storage::backend::DiskBackend).
///
/// The core never inspects these beyond logging them; they are propagated
/// unchanged from listing and ownership queries.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend fault: {0}")]
    Fault(String),

    #[error("disk is locked: {0}")]
    Locked(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed address or scheme. Caller bug, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no disk found for id {id}")]
    NotFound { id: String },

    #[error("mount of {address} failed: {source}")]
    Mount {
        address: DeviceAddress,
        #[source]
        source: BackendError,
    },

    /// The disk is locked and no usable path to its data exists.
    #[error("{id}: Unavailable")]
    Unavailable { id: String },

    #[error("{0}: not implemented")]
    NotImplemented(&'static str),

    /// Reading a disk through the workload currently holding it is not supported yet.
    #[error("online export through holder {holder} is not supported")]
    OnlineExportUnsupported { holder: String },

    #[error("operation {op} cancelled")]
    Cancelled { op: String },

    #[error("operation {op} timed out")]
    Timeout { op: String },

    #[error("storage layer not initialized")]
    NotInitialized,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether the error is a terminal "Unavailable" verdict for a disk.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message() {
        let err = StoreError::Unavailable {
            id: "abc".to_string(),
        };
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "abc: Unavailable");
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let err: StoreError = BackendError::Fault("datastore offline".into()).into();
        assert_eq!(err.to_string(), "backend fault: datastore offline");
        assert!(!err.is_unavailable());
    }
}
