//! Process-shared synchronization primitives
//!
//! Thin wrappers over pthread mutexes and condition variables initialised
//! with `PTHREAD_PROCESS_SHARED`, so they keep working when the memory they
//! live in is mapped into several processes. Objects are initialised in place
//! and never moved afterwards.

use crate::{SharedMemoryError, SharedMemorySafe, Result};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr::addr_of_mut;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        // no pthread_condattr_setclock here, timed waits use the realtime clock
        const CONDVAR_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

        unsafe fn set_condvar_clock(_attr: *mut libc::pthread_condattr_t) -> libc::c_int {
            0
        }
    } else {
        const CONDVAR_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

        unsafe fn set_condvar_clock(attr: *mut libc::pthread_condattr_t) -> libc::c_int {
            libc::pthread_condattr_setclock(attr, CONDVAR_CLOCK)
        }
    }
}

/// Mutex usable from every process that maps the memory it lives in
#[repr(C)]
pub struct SharedMutex<T> {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SharedMutex<T> {}
unsafe impl<T: Send> Sync for SharedMutex<T> {}
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    /// Initialise a mutex in place
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of `Self` and must not be in use by any
    /// thread or process while it is being initialised.
    pub unsafe fn init_at(slot: *mut Self, value: T) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        SharedMemoryError::check_sync(
            "pthread_mutexattr_init",
            libc::pthread_mutexattr_init(attr.as_mut_ptr()),
        )?;

        let mut rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            rc = libc::pthread_mutex_init(UnsafeCell::raw_get(addr_of_mut!((*slot).raw)), attr.as_ptr());
        }
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        SharedMemoryError::check_sync("pthread_mutex_init", rc)?;

        UnsafeCell::raw_get(addr_of_mut!((*slot).data)).write(value);
        Ok(())
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) -> Result<SharedMutexGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        SharedMemoryError::check_sync("pthread_mutex_lock", rc)?;

        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

/// RAII guard, unlocks on drop
pub struct SharedMutexGuard<'a, T> {
    mutex: &'a SharedMutex<T>,
    // pthread mutexes must be unlocked by the thread that locked them
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for SharedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SharedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SharedMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

/// Whether a timed wait gave up before its condition was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// Condition variable usable from every process that maps it
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}
unsafe impl SharedMemorySafe for SharedCondvar {}

impl SharedCondvar {
    /// Initialise a condition variable in place
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init_at`].
    pub unsafe fn init_at(slot: *mut Self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        SharedMemoryError::check_sync(
            "pthread_condattr_init",
            libc::pthread_condattr_init(attr.as_mut_ptr()),
        )?;

        let mut rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            rc = set_condvar_clock(attr.as_mut_ptr());
        }
        if rc == 0 {
            rc = libc::pthread_cond_init(UnsafeCell::raw_get(addr_of_mut!((*slot).raw)), attr.as_ptr());
        }
        libc::pthread_condattr_destroy(attr.as_mut_ptr());

        SharedMemoryError::check_sync("pthread_cond_init", rc)
    }

    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }

    /// Wait while `condition` holds, for at most `timeout` in total
    ///
    /// The condition is evaluated with the lock held, before the first wait
    /// and after every wakeup.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        mut guard: SharedMutexGuard<'a, T>,
        timeout: Duration,
        mut condition: F,
    ) -> Result<(SharedMutexGuard<'a, T>, WaitTimeoutResult)>
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = deadline_after(timeout);

        while condition(&mut *guard) {
            let rc = unsafe {
                libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &deadline)
            };
            match rc {
                0 => {}
                libc::ETIMEDOUT => {
                    let timed_out = condition(&mut *guard);
                    return Ok((guard, WaitTimeoutResult(timed_out)));
                }
                code => {
                    return Err(SharedMemoryError::Sync { op: "pthread_cond_timedwait", code });
                }
            }
        }

        Ok((guard, WaitTimeoutResult(false)))
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(CONDVAR_CLOCK, &mut deadline);
    }

    let mut nanos = deadline.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut secs = (deadline.tv_sec as i64).saturating_add(timeout.as_secs().min(i64::MAX as u64) as i64);
    if nanos >= 1_000_000_000 {
        nanos -= 1_000_000_000;
        secs = secs.saturating_add(1);
    }

    deadline.tv_sec = secs as _;
    deadline.tv_nsec = nanos as _;
    deadline
}
