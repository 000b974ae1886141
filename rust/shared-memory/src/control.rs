//! Control block and chunk pool allocation
//!
//! Allocation is a handshake on one shared status word. A client waits for
//! `Ready`, posts `AllocRequested` and sleeps on the client-facing condvar;
//! the server's [`Arbiter`] picks a free chunk, answers `AllocSucceeded` or
//! `AllocFailed`, and returns to `Ready` once the client acknowledges.

use crate::{
    PortalSegment, SharedCondvar, SharedMemoryError, SharedMemorySafe, SharedMutex, SharedMutexGuard,
    PlatformUtils, Result, SlotHandle, TransferChunk, WaitPolicy, MAX_REGION_SIZE, MIN_REGION_SIZE,
    SHARED_MEMORY_MANAGER_NAME, SHARED_TRANSFER_ARRAY_NAME,
};
use std::mem::{align_of, size_of};
use std::ptr::{addr_of_mut, NonNull};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Arbitration status of the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArbitrationStatus {
    NotReady = 0,
    Ready = 1,
    AllocRequested = 2,
    AllocRequestAcked = 3,
    AllocSucceeded = 4,
    AllocFailed = 5,
    Stopped = 6,
}

impl TryFrom<u8> for ArbitrationStatus {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ArbitrationStatus::NotReady),
            1 => Ok(ArbitrationStatus::Ready),
            2 => Ok(ArbitrationStatus::AllocRequested),
            3 => Ok(ArbitrationStatus::AllocRequestAcked),
            4 => Ok(ArbitrationStatus::AllocSucceeded),
            5 => Ok(ArbitrationStatus::AllocFailed),
            6 => Ok(ArbitrationStatus::Stopped),
            _ => Err(()),
        }
    }
}

/// Fields guarded by the control block mutex
#[repr(C)]
pub struct ArbitrationState {
    status: u8,
    last_granted_index: u32,
    last_granted_generation: u32,
    /// Bumped on every status change, wraps
    transitions: u32,
}

unsafe impl SharedMemorySafe for ArbitrationState {}

impl ArbitrationState {
    pub fn status(&self) -> ArbitrationStatus {
        ArbitrationStatus::try_from(self.status).unwrap_or(ArbitrationStatus::NotReady)
    }

    fn set_status(&mut self, status: ArbitrationStatus) {
        self.status = status as u8;
        self.transitions = self.transitions.wrapping_add(1);
    }

    fn in_flight(&self) -> bool {
        matches!(
            self.status(),
            ArbitrationStatus::AllocRequested
                | ArbitrationStatus::AllocRequestAcked
                | ArbitrationStatus::AllocSucceeded
                | ArbitrationStatus::AllocFailed
        )
    }
}

/// Singleton arbitration state shared by client and server
#[repr(C)]
pub struct ControlBlock {
    state: SharedMutex<ArbitrationState>,
    /// Server sleeps here waiting for requests and acknowledgements
    signal_to_server: SharedCondvar,
    /// Clients sleep here waiting for answers and for `Ready`
    signal_to_client: SharedCondvar,
}

unsafe impl SharedMemorySafe for ControlBlock {}

impl ControlBlock {
    /// Initialise a not-ready control block in place
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init_at`].
    pub unsafe fn init_at(slot: *mut Self) -> Result<()> {
        let state = ArbitrationState {
            status: ArbitrationStatus::NotReady as u8,
            // first scan starts at index 0
            last_granted_index: u32::MAX,
            last_granted_generation: 0,
            transitions: 0,
        };
        SharedMutex::init_at(addr_of_mut!((*slot).state), state)?;
        SharedCondvar::init_at(addr_of_mut!((*slot).signal_to_server))?;
        SharedCondvar::init_at(addr_of_mut!((*slot).signal_to_client))
    }
}

/// View of the control block and chunk array of one mapped segment
///
/// Cheap to clone; every clone keeps the mapping alive.
#[derive(Clone)]
pub struct ChunkPool {
    segment: Arc<PortalSegment>,
    control: NonNull<ControlBlock>,
    chunks: NonNull<TransferChunk>,
    slot_count: usize,
}

// Safety: the pointers target the mapping owned by `segment`, which never
// moves, and everything behind them is process-shared synchronized state.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Construct the control block and as many chunks as fit, then go `Ready`
    ///
    /// One chunk's worth of space is always left unused.
    pub fn create(mut segment: PortalSegment) -> Result<Self> {
        segment.construct::<ControlBlock, _>(SHARED_MEMORY_MANAGER_NAME, 1, |_, slot| unsafe {
            ControlBlock::init_at(slot)
        })?;

        let fitting = segment.remaining_for::<TransferChunk>() / size_of::<TransferChunk>();
        let slot_count = fitting.saturating_sub(1);
        if slot_count == 0 {
            return Err(SharedMemoryError::InvalidSize {
                size: segment.size(),
                min: Self::segment_size_for(1),
                max: MAX_REGION_SIZE,
            });
        }

        segment.construct::<TransferChunk, _>(SHARED_TRANSFER_ARRAY_NAME, slot_count, |_, slot| unsafe {
            TransferChunk::init_at(slot)
        })?;

        let pool = Self::from_segment(Arc::new(segment))?;
        {
            let mut state = pool.control().state.lock()?;
            state.set_status(ArbitrationStatus::Ready);
            pool.control().signal_to_client.notify_all();
        }

        info!(
            "Chunk pool ready in {}: {} chunks of {} bytes",
            pool.segment_name(),
            pool.slot_count,
            size_of::<TransferChunk>()
        );
        Ok(pool)
    }

    /// Locate the control block and chunk array in an opened segment
    pub fn locate(segment: PortalSegment) -> Result<Self> {
        Self::from_segment(Arc::new(segment))
    }

    fn from_segment(segment: Arc<PortalSegment>) -> Result<Self> {
        let control = segment
            .find::<ControlBlock>(SHARED_MEMORY_MANAGER_NAME)?
            .first()
            .map(NonNull::from)
            .ok_or_else(|| SharedMemoryError::ObjectNotFound(SHARED_MEMORY_MANAGER_NAME.to_string()))?;

        let chunks = segment.find::<TransferChunk>(SHARED_TRANSFER_ARRAY_NAME)?;
        let slot_count = chunks.len();
        let chunks = NonNull::from(chunks).cast::<TransferChunk>();

        Ok(Self { segment, control, chunks, slot_count })
    }

    /// Segment size that yields exactly `slots` chunks
    pub fn segment_size_for(slots: usize) -> usize {
        let control = PlatformUtils::align_up(PortalSegment::HEADER_SIZE, align_of::<ControlBlock>())
            + size_of::<ControlBlock>();
        let chunks = PlatformUtils::align_up(control, align_of::<TransferChunk>());
        (chunks + (slots + 1) * size_of::<TransferChunk>()).max(MIN_REGION_SIZE)
    }

    fn control(&self) -> &ControlBlock {
        unsafe { self.control.as_ref() }
    }

    pub fn chunks(&self) -> &[TransferChunk] {
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr(), self.slot_count) }
    }

    pub fn chunk(&self, handle: SlotHandle) -> Option<&TransferChunk> {
        self.chunks().get(handle.index as usize)
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of chunks currently granted
    pub fn busy_count(&self) -> usize {
        self.chunks().iter().filter(|chunk| chunk.is_busy()).count()
    }

    pub fn status(&self) -> Result<ArbitrationStatus> {
        Ok(self.control().state.lock()?.status())
    }

    /// Give a chunk back to the pool if `handle` still holds it
    pub fn release(&self, handle: SlotHandle) -> Result<bool> {
        match self.chunk(handle) {
            Some(chunk) => chunk.release(handle),
            None => Ok(false),
        }
    }

    /// Stop accepting requests and wake everybody waiting on the control block
    pub fn stop(&self) -> Result<()> {
        let control = self.control();
        let mut state = control.state.lock()?;
        state.set_status(ArbitrationStatus::Stopped);
        control.signal_to_server.notify_all();
        control.signal_to_client.notify_all();
        Ok(())
    }

    /// Wait for the control block to accept requests
    ///
    /// Other clients' handshakes count as progress; only one timeout with no
    /// status change gives up.
    pub fn wait_until_ready(&self, policy: &WaitPolicy) -> Result<()> {
        let state = self.control().state.lock()?;
        let single = WaitPolicy::new(policy.timeout, 1);
        let state = self.wait_for_server(state, &single, |s| {
            matches!(s.status(), ArbitrationStatus::NotReady) || s.in_flight()
        })?;

        match state.status() {
            ArbitrationStatus::Ready => Ok(()),
            status => Err(SharedMemoryError::NotReady(format!(
                "control block in {} is {:?}",
                self.segment_name(),
                status
            ))),
        }
    }

    /// Client side of the allocation handshake
    pub fn request_slot(&self, policy: &WaitPolicy) -> Result<SlotHandle> {
        let control = self.control();
        let state = control.state.lock()?;

        // one request in flight at a time
        let mut state = self.wait_for_server(state, policy, |s| s.in_flight())?;
        if state.status() != ArbitrationStatus::Ready {
            return Err(SharedMemoryError::NotReady(format!("arbitration is {:?}", state.status())));
        }

        state.set_status(ArbitrationStatus::AllocRequested);
        control.signal_to_server.notify_all();

        let mut state = self.wait_for_server(state, policy, |s| {
            s.status() == ArbitrationStatus::AllocRequested
        })?;

        let outcome = match state.status() {
            ArbitrationStatus::AllocSucceeded => Ok(SlotHandle {
                index: state.last_granted_index,
                generation: state.last_granted_generation,
            }),
            ArbitrationStatus::AllocFailed => Err(SharedMemoryError::PoolExhausted),
            status => {
                return Err(SharedMemoryError::Protocol(format!(
                    "Unexpected arbitration status {:?}",
                    status
                )))
            }
        };

        state.set_status(ArbitrationStatus::AllocRequestAcked);
        control.signal_to_server.notify_all();
        outcome
    }

    fn wait_for_server<'a, F>(
        &'a self,
        mut state: SharedMutexGuard<'a, ArbitrationState>,
        policy: &WaitPolicy,
        mut pending: F,
    ) -> Result<SharedMutexGuard<'a, ArbitrationState>>
    where
        F: FnMut(&ArbitrationState) -> bool,
    {
        let mut strikes = 0;
        let mut seen = state.transitions;
        loop {
            let (guard, _) = self
                .control()
                .signal_to_client
                .wait_timeout_while(state, policy.timeout, |s| pending(s) && s.transitions == seen)?;
            state = guard;
            if !pending(&*state) {
                return Ok(state);
            }
            if state.transitions != seen {
                // the server answered somebody else; start a fresh deadline
                seen = state.transitions;
                strikes = 0;
                continue;
            }

            strikes += 1;
            warn!("Waiting timeout. {} strike", strikes);
            if strikes >= policy.strike_limit {
                warn!("The server doesn't respond");
                return Err(SharedMemoryError::Timeout { waiting_for: "server", strikes });
            }
        }
    }

    /// Grant the next free chunk, scanning once around from the last grant
    pub(crate) fn find_free_slot(&self, state: &mut ArbitrationState) -> Option<SlotHandle> {
        let count = self.slot_count as u32;
        let start = state.last_granted_index.wrapping_add(1) % count;

        for offset in 0..count {
            let index = (start + offset) % count;
            if let Some(handle) = self.chunks()[index as usize].try_acquire(index) {
                state.last_granted_index = handle.index;
                state.last_granted_generation = handle.generation;
                return Some(handle);
            }
        }
        None
    }
}

/// Outcome of one arbitration step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// Nothing to do, or an acknowledgement was processed
    Idle,
    /// A chunk was granted; its consumer must be started
    Granted(SlotHandle),
    /// A request was refused for lack of free chunks
    Exhausted,
    /// The pool was stopped
    Stopped,
}

/// Server side of the allocation handshake
pub struct Arbiter {
    pool: ChunkPool,
    policy: WaitPolicy,
    strikes: u32,
}

impl Arbiter {
    pub fn new(pool: ChunkPool, policy: WaitPolicy) -> Self {
        Self { pool, policy, strikes: 0 }
    }

    /// Wait for the next request or acknowledgement and answer it
    pub fn poll(&mut self) -> Result<Arbitration> {
        let control = self.pool.control();
        let state = control.state.lock()?;
        let (mut state, result) = control.signal_to_server.wait_timeout_while(state, self.policy.timeout, |s| {
            !matches!(
                s.status(),
                ArbitrationStatus::AllocRequested | ArbitrationStatus::AllocRequestAcked | ArbitrationStatus::Stopped
            )
        })?;

        if result.timed_out() {
            if matches!(state.status(), ArbitrationStatus::AllocSucceeded | ArbitrationStatus::AllocFailed) {
                self.strikes += 1;
                warn!("Waiting timeout. {} strike", self.strikes);
                if self.strikes >= self.policy.strike_limit {
                    warn!("The client didn't acknowledge, arbitration is reset");
                    self.strikes = 0;
                    state.set_status(ArbitrationStatus::Ready);
                    control.signal_to_client.notify_all();
                }
            } else {
                self.strikes = 0;
            }
            return Ok(Arbitration::Idle);
        }

        self.strikes = 0;
        let outcome = match state.status() {
            ArbitrationStatus::AllocRequested => match self.pool.find_free_slot(&mut state) {
                Some(handle) => {
                    debug!(index = handle.index, generation = handle.generation, "Chunk granted");
                    state.set_status(ArbitrationStatus::AllocSucceeded);
                    Arbitration::Granted(handle)
                }
                None => {
                    warn!("No free chunk in {}", self.pool.segment_name());
                    state.set_status(ArbitrationStatus::AllocFailed);
                    Arbitration::Exhausted
                }
            },
            ArbitrationStatus::AllocRequestAcked => {
                state.set_status(ArbitrationStatus::Ready);
                Arbitration::Idle
            }
            _ => return Ok(Arbitration::Stopped),
        };

        control.signal_to_client.notify_all();
        Ok(outcome)
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }
}
