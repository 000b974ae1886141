//! Transfer counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session atomic transfer counters
#[derive(Debug, Default)]
pub struct TransferMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    bytes: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransferMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes: u64,
}

impl TransferStats {
    /// Files that were attempted, skipped ones excluded
    pub fn attempted(&self) -> u64 {
        self.completed + self.failed
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} skipped, {} bytes",
            self.completed, self.failed, self.skipped, self.bytes
        )
    }
}
