//! Transfer chunk: one slot of the pool and its per-transfer state machine
//!
//! A granted chunk is a single-item channel between exactly one producer
//! (the client worker reading a file) and one consumer (the server worker
//! writing it out). Turns alternate through `status`, always under the
//! chunk's own mutex:
//!
//! ```text
//! IDLE -> DATA_READY_FOR_CONSUMER <-> SLOT_READY_FOR_PRODUCER -> TRANSFER_DONE -> IDLE
//! ```

use crate::{
    SharedCondvar, SharedMemoryError, SharedMemorySafe, SharedMutex, SharedMutexGuard, Result,
    WaitPolicy, DATA_FRAME_SIZE, MAX_FILE_NAME_LENGTH,
};
use std::io::{self, Read, Write};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Chunk handshake status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkStatus {
    Idle = 0,
    DataReadyForConsumer = 1,
    SlotReadyForProducer = 2,
    TransferDone = 3,
}

impl TryFrom<u8> for ChunkStatus {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ChunkStatus::Idle),
            1 => Ok(ChunkStatus::DataReadyForConsumer),
            2 => Ok(ChunkStatus::SlotReadyForProducer),
            3 => Ok(ChunkStatus::TransferDone),
            _ => Err(()),
        }
    }
}

/// A granted chunk: its index in the pool and the grant generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

/// Fields guarded by the chunk mutex
#[repr(C)]
pub struct ChunkState {
    status: u8,
    byte_count: u32,
    name: [u8; MAX_FILE_NAME_LENGTH],
    data: [u8; DATA_FRAME_SIZE],
}

unsafe impl SharedMemorySafe for ChunkState {}

impl ChunkState {
    fn idle() -> Self {
        Self {
            status: ChunkStatus::Idle as u8,
            byte_count: 0,
            name: [0; MAX_FILE_NAME_LENGTH],
            data: [0; DATA_FRAME_SIZE],
        }
    }

    pub fn status(&self) -> ChunkStatus {
        ChunkStatus::try_from(self.status).unwrap_or(ChunkStatus::Idle)
    }

    fn set_status(&mut self, status: ChunkStatus) {
        self.status = status as u8;
        trace!(status = status as u8, "Chunk status changed");
    }

    /// Valid bytes in the frame buffer
    pub fn byte_count(&self) -> usize {
        (self.byte_count as usize).min(DATA_FRAME_SIZE)
    }

    pub fn frame(&self) -> &[u8] {
        &self.data[..self.byte_count()]
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_FILE_NAME_LENGTH);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FILE_NAME_LENGTH - 1 {
            return Err(SharedMemoryError::NameTooLong {
                len: bytes.len(),
                limit: MAX_FILE_NAME_LENGTH - 1,
            });
        }

        self.name = [0; MAX_FILE_NAME_LENGTH];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// What a consumer received through a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedTransfer {
    /// Name written by the producer
    pub name: String,
    /// Total bytes handed to the sink
    pub bytes: u64,
    /// Number of frames received
    pub frames: u64,
}

// lease word layout: generation << 1 | busy
fn lease_word(generation: u32, busy: bool) -> u64 {
    (u64::from(generation) << 1) | u64::from(busy)
}

/// One communication slot of the pool
#[repr(C)]
pub struct TransferChunk {
    lease: AtomicU64,
    state: SharedMutex<ChunkState>,
    /// Consumer waits here for data or completion
    data_ready: SharedCondvar,
    /// Producer waits here for the buffer to come back
    slot_ready: SharedCondvar,
}

unsafe impl SharedMemorySafe for TransferChunk {}

impl TransferChunk {
    /// Initialise an idle, free chunk in place
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init_at`].
    pub unsafe fn init_at(slot: *mut Self) -> Result<()> {
        addr_of_mut!((*slot).lease).write(AtomicU64::new(lease_word(0, false)));
        SharedMutex::init_at(addr_of_mut!((*slot).state), ChunkState::idle())?;
        SharedCondvar::init_at(addr_of_mut!((*slot).data_ready))?;
        SharedCondvar::init_at(addr_of_mut!((*slot).slot_ready))
    }

    pub fn is_busy(&self) -> bool {
        self.lease.load(Ordering::Acquire) & 1 == 1
    }

    /// Whether `handle` is still the current grant of this chunk
    pub fn is_held_by(&self, handle: SlotHandle) -> bool {
        self.lease.load(Ordering::Acquire) == lease_word(handle.generation, true)
    }

    /// Current handshake status
    pub fn status(&self) -> Result<ChunkStatus> {
        Ok(self.state.lock()?.status())
    }

    /// Mark a free chunk busy under a new generation
    pub(crate) fn try_acquire(&self, index: u32) -> Option<SlotHandle> {
        let current = self.lease.load(Ordering::Acquire);
        if current & 1 == 1 {
            return None;
        }

        let generation = ((current >> 1) as u32).wrapping_add(1);
        self.lease
            .compare_exchange(current, lease_word(generation, true), Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotHandle { index, generation })
    }

    /// Return the chunk to the pool if `handle` still holds it
    pub fn release(&self, handle: SlotHandle) -> Result<bool> {
        let mut state = self.state.lock()?;
        Ok(self.release_locked(&mut state, handle))
    }

    fn release_locked(&self, state: &mut ChunkState, handle: SlotHandle) -> bool {
        if !self.is_held_by(handle) {
            return false;
        }

        state.set_status(ChunkStatus::Idle);
        state.byte_count = 0;
        let released = self
            .lease
            .compare_exchange(
                lease_word(handle.generation, true),
                lease_word(handle.generation, false),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        self.data_ready.notify_all();
        self.slot_ready.notify_all();
        debug!(index = handle.index, generation = handle.generation, "Chunk released");
        released
    }

    /// Producer side: stream `source` through the chunk, frame by frame
    ///
    /// Returns the number of bytes sent. On any failure the chunk is released
    /// so the consumer can tell the transfer was abandoned.
    pub fn produce<R: Read>(
        &self,
        handle: SlotHandle,
        name: &str,
        source: &mut R,
        policy: &WaitPolicy,
    ) -> Result<u64> {
        let mut state = self.state.lock()?;
        if !self.is_held_by(handle) {
            return Err(SharedMemoryError::Abandoned { index: handle.index });
        }
        if let Err(e) = state.set_name(name) {
            self.release_locked(&mut state, handle);
            return Err(e);
        }

        let mut sent = 0u64;
        loop {
            let count = match read_frame(source, &mut state.data) {
                Ok(count) => count,
                Err(e) => {
                    self.release_locked(&mut state, handle);
                    return Err(e.into());
                }
            };
            state.byte_count = count as u32;

            if count == 0 {
                state.set_status(ChunkStatus::TransferDone);
                self.data_ready.notify_all();
                trace!(index = handle.index, sent, "Transfer done");
                return Ok(sent);
            }

            sent += count as u64;
            state.set_status(ChunkStatus::DataReadyForConsumer);
            self.data_ready.notify_all();

            state = self.wait_for_turn(state, handle, policy, &self.slot_ready, "consumer", |s| {
                s.status() == ChunkStatus::SlotReadyForProducer
            })?;
        }
    }

    /// Consumer side: drain frames into `sink` until the producer finishes
    ///
    /// The chunk is released on completion and on every failure.
    pub fn consume<W: Write>(
        &self,
        handle: SlotHandle,
        sink: &mut W,
        policy: &WaitPolicy,
    ) -> Result<ConsumedTransfer> {
        let mut state = self.state.lock()?;
        let mut received = ConsumedTransfer { name: String::new(), bytes: 0, frames: 0 };

        loop {
            if !self.is_held_by(handle) {
                return Err(SharedMemoryError::Abandoned { index: handle.index });
            }

            match state.status() {
                ChunkStatus::DataReadyForConsumer => {
                    if let Err(e) = sink.write_all(state.frame()) {
                        self.release_locked(&mut state, handle);
                        return Err(e.into());
                    }
                    received.bytes += state.byte_count() as u64;
                    received.frames += 1;
                }
                ChunkStatus::TransferDone => {
                    received.name = state.name();
                    self.release_locked(&mut state, handle);
                    trace!(index = handle.index, bytes = received.bytes, "Transfer received");
                    return Ok(received);
                }
                ChunkStatus::Idle | ChunkStatus::SlotReadyForProducer => {}
            }

            state.set_status(ChunkStatus::SlotReadyForProducer);
            self.slot_ready.notify_all();

            state = self.wait_for_turn(state, handle, policy, &self.data_ready, "producer", |s| {
                matches!(s.status(), ChunkStatus::DataReadyForConsumer | ChunkStatus::TransferDone)
            })?;
        }
    }

    /// Wait on `condvar` until `ready` holds, counting timeouts as strikes
    fn wait_for_turn<'a, F>(
        &'a self,
        mut state: SharedMutexGuard<'a, ChunkState>,
        handle: SlotHandle,
        policy: &WaitPolicy,
        condvar: &SharedCondvar,
        waiting_for: &'static str,
        mut ready: F,
    ) -> Result<SharedMutexGuard<'a, ChunkState>>
    where
        F: FnMut(&ChunkState) -> bool,
    {
        let mut strikes = 0;
        loop {
            let (guard, result) = condvar.wait_timeout_while(state, policy.timeout, |s| {
                !ready(s) && self.is_held_by(handle)
            })?;
            state = guard;

            if !self.is_held_by(handle) {
                return Err(SharedMemoryError::Abandoned { index: handle.index });
            }
            if !result.timed_out() {
                return Ok(state);
            }

            strikes += 1;
            warn!(index = handle.index, "Waiting timeout. {} strike", strikes);
            if strikes >= policy.strike_limit {
                warn!(index = handle.index, "The {} doesn't respond, chunk is released", waiting_for);
                self.release_locked(&mut state, handle);
                return Err(SharedMemoryError::Timeout { waiting_for, strikes });
            }
        }
    }
}

/// Fill `frame` from `source`, short only at end of input
fn read_frame<R: Read>(source: &mut R, frame: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < frame.len() {
        match source.read(&mut frame[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
