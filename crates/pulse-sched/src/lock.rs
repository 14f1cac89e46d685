//! Host-appropriate mutual exclusion.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A lock suited to the environment that handed it out.
///
/// In a threaded host this is a real mutex with blocking acquisition. In a
/// cooperative host it is a plain marker: with a single thread of control
/// nothing can contend, and a blocking wait would deadlock the runtime, so
/// acquisition always succeeds immediately. Callers must not rely on a
/// cooperative lock to exclude anything — only to detect reentrancy.
#[derive(Clone)]
pub struct AsyncLock {
    inner: LockImpl,
}

#[derive(Clone)]
enum LockImpl {
    Real(Arc<RealLock>),
    Marker(Arc<AtomicBool>),
}

struct RealLock {
    locked: Mutex<bool>,
    unlocked: Condvar,
}

impl AsyncLock {
    pub(crate) fn real() -> Self {
        Self {
            inner: LockImpl::Real(Arc::new(RealLock {
                locked: Mutex::new(false),
                unlocked: Condvar::new(),
            })),
        }
    }

    pub(crate) fn marker() -> Self {
        Self {
            inner: LockImpl::Marker(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Acquire without blocking. Returns whether the lock was taken.
    pub fn try_acquire(&self) -> bool {
        match &self.inner {
            LockImpl::Real(lock) => {
                let mut locked = lock.locked.lock();
                if *locked {
                    false
                } else {
                    *locked = true;
                    true
                }
            }
            LockImpl::Marker(flag) => flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    /// Acquire, blocking in a threaded host until the holder releases. In a
    /// cooperative host this is `try_acquire` — there is nobody to wait for.
    pub fn acquire(&self) -> bool {
        match &self.inner {
            LockImpl::Real(lock) => {
                let mut locked = lock.locked.lock();
                while *locked {
                    lock.unlocked.wait(&mut locked);
                }
                *locked = true;
                true
            }
            LockImpl::Marker(_) => self.try_acquire(),
        }
    }

    /// Release the lock.
    pub fn release(&self) {
        match &self.inner {
            LockImpl::Real(lock) => {
                let mut locked = lock.locked.lock();
                *locked = false;
                lock.unlocked.notify_one();
            }
            LockImpl::Marker(flag) => flag.store(false, Ordering::Release),
        }
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        match &self.inner {
            LockImpl::Real(lock) => *lock.locked.lock(),
            LockImpl::Marker(flag) => flag.load(Ordering::Acquire),
        }
    }
}
