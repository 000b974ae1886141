//! File Portal
//!
//! Transfers files between a client and a server process on the same host.
//! The server owns a shared memory segment holding a fixed pool of transfer
//! chunks; client workers negotiate a chunk through the control block and
//! stream their file through it frame by frame to a server worker.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod server;

pub use cli::{Cli, Command};
pub use client::{ClientSession, FailureBreakdown, FileOutcome};
pub use config::PortalConfig;
pub use error::{PortalError, Result};
pub use metrics::{TransferMetrics, TransferStats};
pub use server::ServerSession;

/// Externally visible state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Segment missing, lookup failed, or server not started
    NotReady,
    /// Transfers may still be running
    Active,
    /// All client workers exited, or the server was stopped
    Completed,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }
}
