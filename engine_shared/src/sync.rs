//! Synchronization primitives used by the scene scheduler.
//!
//! - [`WaitableLatch`]: a resettable binary signal with blocking waits.
//! - [`PhysicsWorld`]: a shared handle to the backend guarded by one read/write lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// How long a [`WaitableLatch::wait_timeout`] call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Sample the latch and return immediately.
    Poll,
    Millis(u64),
    Infinite,
}

impl WaitTimeout {
    /// `block == true` waits forever, `false` polls.
    pub fn from_block(block: bool) -> Self {
        if block {
            WaitTimeout::Infinite
        } else {
            WaitTimeout::Poll
        }
    }
}

/// Binary signal with blocking wait and reset.
///
/// Waiting on a latch that is never set hangs the caller.
#[derive(Debug, Default)]
pub struct WaitableLatch {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitableLatch {
    /// Creates a latch in the not-signaled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a latch that is already signaled.
    pub fn new_set() -> Self {
        Self {
            signaled: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Signals the latch and wakes every waiter.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Returns the current state without blocking.
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until the latch is signaled.
    pub fn wait(&self) -> bool {
        self.wait_timeout(WaitTimeout::Infinite)
    }

    /// Blocks until signaled or the timeout elapses. Returns `true` iff signaled.
    pub fn wait_timeout(&self, timeout: WaitTimeout) -> bool {
        let mut signaled = self.signaled.lock();
        match timeout {
            WaitTimeout::Poll => *signaled,
            WaitTimeout::Infinite => {
                while !*signaled {
                    self.cond.wait(&mut signaled);
                }
                true
            }
            WaitTimeout::Millis(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms);
                while !*signaled {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                *signaled
            }
        }
    }
}

/// Shared handle to a physics backend behind a single read/write lock.
///
/// Reads are recursive on the same thread and run concurrently with each other, never
/// with the in-flight write (the scheduler's step and fetch). Do not hold a guard across
/// `fetch_results`, which takes the write side.
pub struct PhysicsWorld<B> {
    inner: Arc<RwLock<B>>,
}

impl<B> Clone for PhysicsWorld<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> PhysicsWorld<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(RwLock::new(backend)),
        }
    }

    /// Shared access for queries. Safe to nest on one thread.
    pub fn read(&self) -> RwLockReadGuard<'_, B> {
        self.inner.read_recursive()
    }

    /// Exclusive access. Not reentrant.
    pub fn write(&self) -> RwLockWriteGuard<'_, B> {
        self.inner.write()
    }

    pub fn try_write_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, B>> {
        self.inner.try_write_for(timeout)
    }
}
