//! Busy-waiting locks for polling workers.
//!
//! [`SpinLock`] is a plain test-and-test-and-set lock. The `*_tm` methods
//! elide the lock with a hardware transaction when the lock was built from
//! [`Capabilities`] reporting RTM, and take the spin path otherwise; the two
//! paths are interchangeable on the same lock.

mod recursive;
mod rtm;

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

pub use recursive::{RecursiveGuard, RecursiveSpinLock};

use crate::config::Capabilities;
use crate::errors::{Error, Result};

pub struct SpinLock {
    locked: AtomicU32,
    elide: bool,
}

impl SpinLock {
    /// An unlocked lock that never elides.
    pub const fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
            elide: false,
        }
    }

    /// An unlocked lock whose `*_tm` methods elide when `caps` has RTM.
    pub const fn with_capabilities(caps: &Capabilities) -> Self {
        Self {
            locked: AtomicU32::new(0),
            elide: caps.rtm,
        }
    }

    /// Whether the `*_tm` methods attempt hardware elision.
    pub fn elides(&self) -> bool {
        self.elide
    }

    /// Spins until the lock is taken. Taking it twice from the same
    /// thread spins forever.
    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// The caller must hold the lock through [`lock`](Self::lock) or a
    /// successful [`try_lock`](Self::try_lock).
    #[inline]
    pub unsafe fn unlock(&self) {
        self.locked.store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
    }

    /// Takes the lock, eliding it if possible.
    #[inline]
    pub fn lock_tm(&self) {
        // SAFETY: `elide` is only set when the CPU reported RTM.
        if self.elide && unsafe { rtm::try_elide(&self.locked, true) } {
            return;
        }
        self.lock();
    }

    #[inline]
    pub fn try_lock_tm(&self) -> bool {
        // SAFETY: as in `lock_tm`.
        if self.elide && unsafe { rtm::try_elide(&self.locked, false) } {
            return true;
        }
        self.try_lock()
    }

    /// Commits the elided section or releases the lock.
    ///
    /// # Safety
    /// The caller must hold the lock through [`lock_tm`](Self::lock_tm) or a
    /// successful [`try_lock_tm`](Self::try_lock_tm), on the same thread.
    #[inline]
    pub unsafe fn unlock_tm(&self) {
        // SAFETY: `elide` implies RTM; inside a transaction opened by
        // `try_elide` the lock word is still zero.
        unsafe {
            if self.elide && rtm::in_transaction() && !self.is_locked() {
                rtm::commit();
            } else {
                self.unlock();
            }
        }
    }

    /// Takes the lock (eliding if possible) and releases it on drop.
    pub fn lock_guard(&self) -> SpinLockGuard<'_> {
        self.lock_tm();
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Like [`lock_guard`](Self::lock_guard) but fails with
    /// [`Error::LockContended`] instead of spinning.
    pub fn try_lock_guard(&self) -> Result<SpinLockGuard<'_>> {
        if self.try_lock_tm() {
            Ok(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(Error::LockContended)
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .field("elide", &self.elide)
            .finish()
    }
}

/// Releases a [`SpinLock`] when dropped. Must be dropped on the thread that
/// took it, since an elided section can only commit there.
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the lock is held by this thread.
        unsafe { self.lock.unlock_tm() }
    }
}

/// Data protected by a [`SpinLock`].
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub const fn with_capabilities(value: T, caps: &Capabilities) -> Self {
        Self {
            lock: SpinLock::with_capabilities(caps),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        SpinGuard {
            _guard: self.lock.lock_guard(),
            data: &self.data,
        }
    }

    pub fn try_lock(&self) -> Result<SpinGuard<'_, T>> {
        Ok(SpinGuard {
            _guard: self.lock.try_lock_guard()?,
            data: &self.data,
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct SpinGuard<'a, T> {
    _guard: SpinLockGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &mut *self.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn try_guard_reports_contention() {
        let lock = SpinLock::new();
        let guard = lock.lock_guard();
        assert!(matches!(lock.try_lock_guard(), Err(Error::LockContended)));
        drop(guard);
        assert!(lock.try_lock_guard().is_ok());
    }

    fn hammer(mutex: Arc<SpinMutex<u64>>) -> u64 {
        const THREADS: usize = 4;
        const ITERS: u64 = 10_000;
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total = *mutex.lock();
        assert_eq!(total, THREADS as u64 * ITERS);
        total
    }

    #[test]
    fn mutex_serializes_increments() {
        hammer(Arc::new(SpinMutex::new(0)));
    }

    #[test]
    fn detected_capabilities_behave_like_spin_path() {
        let caps = Capabilities::detect();
        let mutex = Arc::new(SpinMutex::with_capabilities(0, &caps));
        hammer(mutex);
    }

    #[test]
    fn tm_and_plain_paths_mix() {
        let lock = SpinLock::with_capabilities(&Capabilities::detect());
        lock.lock();
        assert!(!lock.try_lock_tm());
        unsafe { lock.unlock() };
        assert!(lock.try_lock_tm());
        unsafe { lock.unlock_tm() };
        assert!(!lock.is_locked());
    }
}
