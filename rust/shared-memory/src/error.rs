//! Shared memory specific error types

use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Region not found
    #[error("Shared memory region not found: {0}")]
    RegionNotFound(String),

    /// Region already exists
    #[error("Shared memory region already exists: {0}")]
    RegionExists(String),

    /// Invalid region size
    #[error("Invalid region size: {size}, must be between {min} and {max}")]
    InvalidSize { size: usize, min: usize, max: usize },

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Named object missing from the segment directory
    #[error("Shared object not found: {0}")]
    ObjectNotFound(String),

    /// Named object exists but was built with a different layout
    #[error("Layout mismatch for {name}: expected {expected} bytes per element, found {found}")]
    LayoutMismatch { name: String, expected: usize, found: usize },

    /// Control block is not accepting requests
    #[error("Shared memory is not ready: {0}")]
    NotReady(String),

    /// pthread primitive failure
    #[error("Synchronization error in {op}: errno {code}")]
    Sync { op: &'static str, code: i32 },

    /// Peer did not answer within the strike limit
    #[error("Timed out waiting for {waiting_for} after {strikes} strikes")]
    Timeout { waiting_for: &'static str, strikes: u32 },

    /// No free transfer chunk
    #[error("Transfer chunk pool exhausted")]
    PoolExhausted,

    /// Lease on the chunk was released by the peer or re-granted
    #[error("Transfer chunk {index} was abandoned")]
    Abandoned { index: u32 },

    /// Name does not fit into the chunk name field
    #[error("Name is {len} bytes, limit is {limit}")]
    NameTooLong { len: usize, limit: usize },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

impl SharedMemoryError {
    /// Peer stopped responding or gave the chunk up
    pub fn is_liveness_failure(&self) -> bool {
        matches!(self, SharedMemoryError::Timeout { .. } | SharedMemoryError::Abandoned { .. })
    }

    /// Convert platform-specific error codes to SharedMemoryError
    pub fn from_platform_error(error: i32, message: impl Into<String>) -> Self {
        match error {
            libc::EACCES => SharedMemoryError::PermissionDenied(message.into()),
            libc::ENOENT => SharedMemoryError::RegionNotFound(message.into()),
            libc::EEXIST => SharedMemoryError::RegionExists(message.into()),
            _ => SharedMemoryError::Platform(format!("Error {}: {}", error, message.into())),
        }
    }

    /// Map a pthread return code
    pub(crate) fn check_sync(op: &'static str, code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(SharedMemoryError::Sync { op, code })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_failures() {
        let timeout = SharedMemoryError::Timeout { waiting_for: "server", strikes: 3 };
        assert!(timeout.is_liveness_failure());
        assert!(SharedMemoryError::Abandoned { index: 2 }.is_liveness_failure());

        let layout = SharedMemoryError::LayoutMismatch { name: "x".into(), expected: 8, found: 16 };
        assert!(!layout.is_liveness_failure());
        assert!(!SharedMemoryError::PoolExhausted.is_liveness_failure());
    }

    #[test]
    fn test_platform_error_mapping() {
        assert!(matches!(
            SharedMemoryError::from_platform_error(libc::ENOENT, "shm_open"),
            SharedMemoryError::RegionNotFound(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_platform_error(libc::EEXIST, "shm_open"),
            SharedMemoryError::RegionExists(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_platform_error(libc::EACCES, "shm_open"),
            SharedMemoryError::PermissionDenied(_)
        ));
        assert!(SharedMemoryError::check_sync("pthread_mutex_lock", 0).is_ok());
        assert!(matches!(
            SharedMemoryError::check_sync("pthread_mutex_lock", libc::EINVAL),
            Err(SharedMemoryError::Sync { code, .. }) if code == libc::EINVAL
        ));
    }
}
