//! File Portal - Shared Memory Module
//!
//! Fixed-size shared memory segment holding a pool of transfer chunks and the
//! control block that arbitrates them between a client and a server process.

pub mod platform;
pub mod region;
pub mod segment;
pub mod sync;
pub mod chunk;
pub mod control;
pub mod error;

pub use region::*;
pub use segment::*;
pub use sync::*;
pub use chunk::*;
pub use control::*;
pub use error::*;

pub use platform::*;

use std::time::Duration;

/// Current version of the shared segment layout
pub const SHARED_MEMORY_VERSION: u32 = 2;

/// Shared segment magic number
pub const SHARED_MEMORY_MAGIC: u32 = 0x4650_4F52; // "FPOR"

/// Well-known name of the shared memory segment
pub const SHARED_MEMORY_NAME: &str = "/file_portal_transfer_segment";

/// Well-known name of the control block inside the segment
pub const SHARED_MEMORY_MANAGER_NAME: &str = "file_portal_control_block";

/// Well-known name of the transfer chunk array inside the segment
pub const SHARED_TRANSFER_ARRAY_NAME: &str = "file_portal_chunk_array";

/// Default shared memory segment size (256KB)
pub const DEFAULT_SEGMENT_SIZE: usize = 256 * 1024;

/// Bytes moved through a chunk per handshake round
pub const DATA_FRAME_SIZE: usize = 256;

/// Capacity of the chunk name field, terminator included
pub const MAX_FILE_NAME_LENGTH: usize = 256;

/// Default bound on a single condition variable wait
pub const CONDITION_VARIABLE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Consecutive timeouts after which a participant gives up
pub const CONDITION_VARIABLE_STRIKE_LIMIT: u32 = 3;

/// Timeout and retry policy applied at every synchronization point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Bound on one condition variable wait
    pub timeout: Duration,
    /// Consecutive timeouts tolerated before abandoning
    pub strike_limit: u32,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, strike_limit: u32) -> Self {
        Self { timeout, strike_limit: strike_limit.max(1) }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(CONDITION_VARIABLE_TIMEOUT, CONDITION_VARIABLE_STRIKE_LIMIT)
    }
}
