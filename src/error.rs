//! Session-level error types

use file_portal_shared_memory::SharedMemoryError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by client and server sessions
#[derive(Error, Debug)]
pub enum PortalError {
    /// Shared segment, control block or chunk failure
    #[error(transparent)]
    SharedMemory(#[from] SharedMemoryError),

    /// Local file failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path does not fit into the chunk name field
    #[error("File name of {path:?} is {len} bytes, limit is {limit}")]
    NameTooLong { path: PathBuf, len: usize, limit: usize },

    /// Session could not attach to a usable segment
    #[error("Session is not ready: {0}")]
    NotReady(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker thread panicked
    #[error("Worker for {0:?} panicked")]
    WorkerPanicked(PathBuf),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Whether the transfer was lost to an unresponsive or vanished peer
    pub fn is_liveness_failure(&self) -> bool {
        matches!(self, PortalError::SharedMemory(e) if e.is_liveness_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_classification() {
        let timeout: PortalError = SharedMemoryError::Timeout { waiting_for: "consumer", strikes: 3 }.into();
        assert!(timeout.is_liveness_failure());

        let exhausted: PortalError = SharedMemoryError::PoolExhausted.into();
        assert!(!exhausted.is_liveness_failure());
        assert_eq!(exhausted.to_string(), "Transfer chunk pool exhausted");
    }
}
